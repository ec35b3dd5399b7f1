//! Mailseal CLI - S/MIME for mail files
//!
//! Usage:
//!   mailseal seal     - Sign and/or encrypt an RFC 5322 message
//!   mailseal open     - Decrypt and/or verify a received message
//!   mailseal check    - Load every configured credential
//!   mailseal keychain - Manage key passphrases in the OS keychain

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mailseal_core::config::KEYCHAIN_SERVICE;
use mailseal_core::{EnvelopeLayout, MailMessage, Mailer, RawMessage, X509Settings};
use mailseal_crypto::{CertificateContext, KeychainProvider};
use secrecy::SecretString;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "mailseal")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "S/MIME signing and encryption for mail", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a draft message
    Seal {
        /// JSON settings file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Sign regardless of the configuration
        #[arg(long, overrides_with = "no_sign")]
        sign: bool,

        /// Do not sign
        #[arg(long)]
        no_sign: bool,

        /// Encrypt regardless of the configuration
        #[arg(long, overrides_with = "no_encrypt")]
        encrypt: bool,

        /// Do not encrypt
        #[arg(long)]
        no_encrypt: bool,

        /// attachment, opaque or clear-signed
        #[arg(long)]
        layout: Option<EnvelopeLayout>,

        /// Message file, `-` for stdin
        input: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Open a received message and print its body
    Open {
        /// JSON settings file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Treat the input as a bare PKCS#7 envelope
        #[arg(long)]
        bare: bool,

        /// Certificate the signature must come from
        #[arg(long)]
        expect_signer: Option<PathBuf>,

        /// Message file, `-` for stdin
        input: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load every configured certificate and key
    Check {
        /// JSON settings file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Manage key passphrases in the OS keychain
    Keychain {
        #[command(subcommand)]
        action: KeychainAction,
    },
}

#[derive(Subcommand)]
enum KeychainAction {
    /// Store a passphrase read from stdin
    Set {
        /// Account name, referenced as `keychain:ACCOUNT` in settings
        account: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    // stdout carries mail, logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Seal {
            config,
            sign,
            no_sign,
            encrypt,
            no_encrypt,
            layout,
            input,
            output,
        } => {
            let mailer = Mailer::new(load_settings(config.as_deref())?);
            let overrides = X509Settings {
                sign_enable: switch(sign, no_sign),
                crypt_enable: switch(encrypt, no_encrypt),
                layout,
                ..X509Settings::default()
            };

            let draft = MailMessage::parse(&read_input(&input)?)
                .context("Input is not an RFC 5322 message")?;
            let sealed = mailer.seal_with(&draft, overrides)?;
            write_output(output.as_deref(), &sealed.to_bytes())?;
        }

        Commands::Open {
            config,
            bare,
            expect_signer,
            input,
            output,
        } => {
            let mailer = Mailer::new(load_settings(config.as_deref())?);
            let expected = expect_signer
                .as_deref()
                .map(|path| CertificateContext::load_certificate(path, None))
                .transpose()?;

            let bytes = read_input(&input)?;
            let raw = if bare {
                RawMessage::Bare(bytes)
            } else {
                RawMessage::parse(&bytes).context("Input is not an RFC 5322 message")?
            };

            let recovered = mailer.open_with(&raw, X509Settings::default(), expected.as_ref())?;
            write_output(output.as_deref(), &recovered.body)?;

            info!(decrypted = recovered.decrypted, "Recovered message body");
            match recovered.verified {
                Some(true) => info!(
                    signer = recovered.signer.as_deref().unwrap_or("unknown"),
                    "Signature valid"
                ),
                Some(false) => warn!(
                    signer = recovered.signer.as_deref().unwrap_or("unknown"),
                    "Signature INVALID"
                ),
                None => info!("Message was not signed"),
            }
            if recovered.signature_failed() {
                bail!("Signature verification failed");
            }
        }

        Commands::Check { config } => {
            let mailer = Mailer::new(load_settings(Some(&config))?);
            let settings = mailer.defaults();

            println!("policy: {}", settings.policy());
            println!("layout: {:?}", settings.layout());
            println!("on failure: {:?}", settings.failure_policy());
            if settings.sign_cert.is_some() {
                let signer = mailer.signer(settings)?;
                println!("signer: {}", signer.subject());
            }
            if settings.crypt_cert.is_some() {
                let recipient = mailer.recipient(settings)?;
                println!("recipient: {}", recipient.subject());
                println!("cipher: {}", recipient.cipher()?);
                if !recipient.has_private_key() {
                    println!("  (certificate only, cannot decrypt)");
                }
            }
        }

        Commands::Keychain { action } => match action {
            KeychainAction::Set { account } => {
                let mut line = String::new();
                io::stdin()
                    .read_line(&mut line)
                    .context("Cannot read passphrase from stdin")?;
                let passphrase = SecretString::new(line.trim_end_matches(['\r', '\n']).to_string());

                let keychain = KeychainProvider::new(KEYCHAIN_SERVICE);
                keychain.store_passphrase(&account, &passphrase)?;
                info!(account = %account, service = keychain.service_name(), "Stored passphrase");
            }
        },
    }

    Ok(())
}

/// `--x` / `--no-x` pair; neither means "use the configuration"
fn switch(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<X509Settings> {
    match path {
        Some(path) => X509Settings::from_file(path)
            .with_context(|| format!("Cannot load settings from {}", path.display())),
        None => Ok(X509Settings::default()),
    }
}

fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    fs::read(path).with_context(|| format!("Cannot read {}", path.display()))
}

fn write_output(path: Option<&Path>, bytes: &[u8]) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            fs::write(path, bytes).with_context(|| format!("Cannot write {}", path.display()))
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.flush()?;
            Ok(())
        }
    }
}
