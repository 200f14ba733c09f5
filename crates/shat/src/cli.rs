//! Command-line interface for `shat`.
//!
//! # Examples
//!
//! ```bash
//! # Listen on the default address with an ephemeral host key
//! shat
//!
//! # Persistent host key, operator keys and a message of the day
//! shat --key ~/.ssh/id_ed25519 --ops ./operators --motd ./motd.txt
//!
//! # Encrypted host key
//! IDENTITY_PASSPHRASE=secret shat --key ./host_key
//! ```

use std::path::PathBuf;

use clap::Parser;

/// Environment variable holding the host key passphrase.
pub const PASSPHRASE_ENV: &str = "IDENTITY_PASSPHRASE";

/// SSH terminal server.
#[derive(Parser, Debug, Clone)]
#[command(name = "shat", author, version, about = "SSH terminal server")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, short = 'a', default_value = shat_sshd::DEFAULT_ADDRESS, env = "SHAT_ADDRESS")]
    pub address: String,

    /// Private key used as the host identity
    ///
    /// Without it an ephemeral key is generated on every start. A leading
    /// `~/` expands to the home directory.
    #[arg(long, short = 'i', env = "SHAT_KEY")]
    pub key: Option<PathBuf>,

    /// File of operator public keys in authorized_keys format
    ///
    /// Operator keys only limit access together with `--restricted`.
    #[arg(long, env = "SHAT_OPS")]
    pub ops: Option<PathBuf>,

    /// Admit only the keys listed in `--ops`
    #[arg(long, env = "SHAT_RESTRICTED", requires = "ops")]
    pub restricted: bool,

    /// Message of the day shown to every client
    #[arg(long, env = "SHAT_MOTD")]
    pub motd: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
