use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use keyproof::commands::{self, ExplicitKeys, SeedSource};
use keyproof::protocol::records::{PARTIALS_FILE, PRIVKEYS_FILE, SIGNED_TX_FILE, XPUBS_FILE};
use keyproof::storage::FileStorage;
use keyproof::{CommandResult, ProtocolParams};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keyproof")]
#[command(about = "Prove control of an m-of-n P2WSH address without moving funds", long_about = None)]
struct Cli {
    /// Directory holding the session's records
    #[arg(long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Protocol parameters JSON (defaults to version 1 on mainnet)
    #[arg(long, global = true)]
    params: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive n keys from a seed and print the m-of-n P2WSH address
    #[command(group(ArgGroup::new("seed").args(["hex_seed", "mnemonic"])))]
    Gen {
        /// Total number of keys
        #[arg(long, short = 'n', default_value = "3")]
        n: usize,

        /// Threshold (signatures required)
        #[arg(long, short = 'm', default_value = "2")]
        m: usize,

        /// BIP-32 master seed in hex (random if no seed source is given)
        #[arg(long)]
        hex_seed: Option<String>,

        /// BIP-39 mnemonic phrase to import
        #[arg(long)]
        mnemonic: Option<String>,

        /// BIP-39 passphrase
        #[arg(long, requires = "mnemonic")]
        passphrase: Option<String>,

        /// Derivation path template; 'i' is replaced with the key index
        #[arg(long, default_value = "m/84'/0'/0'/0/i")]
        path: String,
    },

    /// Bind a challenge into an unsigned proof transaction
    CreateUnsigned {
        /// P2WSH address being proven
        #[arg(long)]
        address: String,

        /// 32-byte challenge in hex
        #[arg(long)]
        challenge: String,

        /// Public key records
        #[arg(long, default_value = XPUBS_FILE)]
        xpubs: String,

        /// Threshold
        #[arg(long, short = 'm', default_value = "2")]
        m: usize,
    },

    /// Sign unsigned proof records with local private keys
    Sign {
        /// Unsigned record(s) (repeatable)
        #[arg(long = "tx", required = true)]
        unsigned: Vec<String>,

        /// Private key records
        #[arg(long, default_value = PRIVKEYS_FILE)]
        privkeys: String,

        /// Output file for partial signatures
        #[arg(long, default_value = PARTIALS_FILE)]
        out: String,

        /// Expected 32-byte challenge in hex; refuse to sign any other binding
        #[arg(long)]
        challenge: Option<String>,
    },

    /// Combine partial signatures into the signed proof transaction
    Assemble {
        /// Any one unsigned record of the session
        #[arg(long = "tx")]
        unsigned: String,

        /// Partial signature file(s) (repeatable)
        #[arg(long = "sigs", required = true)]
        partials: Vec<String>,

        /// Public key records, in script order
        #[arg(long, default_value = XPUBS_FILE)]
        xpubs: String,

        /// Output file for the signed transaction hex
        #[arg(long, default_value = SIGNED_TX_FILE)]
        out: String,
    },

    /// Verify a signed proof transaction
    Verify {
        /// Signed transaction: hex, or a file in --dir
        #[arg(long)]
        tx: String,

        /// 32-byte challenge in hex
        #[arg(long)]
        challenge: String,

        /// P2WSH address being proven
        #[arg(long)]
        address: String,

        /// Verify against these public key records instead of the embedded script
        #[arg(long, requires = "m")]
        xpubs: Option<String>,

        /// Threshold (with --xpubs)
        #[arg(long, short = 'm', requires = "xpubs")]
        m: Option<usize>,
    },
}

fn print_result(cmd_result: &CommandResult) {
    println!("{}", cmd_result.output);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📋 Result JSON:");
    println!("{}\n", cmd_result.result);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let params = match &cli.params {
        Some(path) => ProtocolParams::load(path)
            .with_context(|| format!("Failed to load parameters from {}", path.display()))?,
        None => ProtocolParams::v1(),
    };
    let storage = FileStorage::new(&cli.dir)?;

    let cmd_result = match cli.command {
        Commands::Gen {
            n,
            m,
            hex_seed,
            mnemonic,
            passphrase,
            path,
        } => {
            let source = match (hex_seed, mnemonic) {
                (Some(hex), _) => SeedSource::Hex(hex),
                (None, Some(words)) => SeedSource::Mnemonic {
                    words,
                    passphrase: passphrase.unwrap_or_default(),
                },
                (None, None) => SeedSource::Random,
            };
            commands::generate_core(n, m, &source, &path, &params, &storage)?
        }
        Commands::CreateUnsigned {
            address,
            challenge,
            xpubs,
            m,
        } => commands::create_unsigned_core(&address, &challenge, m, &xpubs, &params, &storage)?,
        Commands::Sign {
            unsigned,
            privkeys,
            out,
            challenge,
        } => commands::sign_core(
            &unsigned,
            &privkeys,
            &out,
            challenge.as_deref(),
            &params,
            &storage,
        )?,
        Commands::Assemble {
            unsigned,
            partials,
            xpubs,
            out,
        } => commands::assemble_core(&unsigned, &partials, &xpubs, &out, &params, &storage)?,
        Commands::Verify {
            tx,
            challenge,
            address,
            xpubs,
            m,
        } => {
            let explicit = match (xpubs.as_deref(), m) {
                (Some(xpubs_file), Some(threshold)) => Some(ExplicitKeys {
                    xpubs_file,
                    threshold,
                }),
                _ => None,
            };
            commands::verify_core(&tx, &challenge, &address, explicit, &params, &storage)?
        }
    };

    print_result(&cmd_result);
    Ok(())
}
