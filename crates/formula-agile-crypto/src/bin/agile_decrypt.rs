use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use formula_agile_crypto::{DecryptLimits, DecryptOptions, EncryptedOfficeFile, KeySource};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "agile-decrypt",
    about = "Decrypt an Agile-encrypted (MS-OFFCRYPTO 4.4) Office document to its OOXML package."
)]
#[command(group(
    ArgGroup::new("key")
        .required(true)
        .args(["secret_key", "private_key", "password"])
))]
struct Args {
    /// Package secret key as hex.
    #[arg(short = 'k', long, value_name = "HEX")]
    secret_key: Option<String>,

    /// PEM file with the RSA private key matching the document's certificate encryptor.
    #[arg(short = 'p', long, value_name = "PEM")]
    private_key: Option<PathBuf>,

    /// Document password.
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Encrypted compound file (.docx/.xlsx/.pptx).
    infile: PathBuf,

    /// Where to write the decrypted package (default: stdout).
    outfile: Option<PathBuf>,

    /// Truncate the output to the size declared in the `EncryptedPackage` header.
    #[arg(long)]
    truncate: bool,

    /// Write segments as they are decrypted instead of buffering the whole package.
    #[arg(long)]
    streaming: bool,

    /// Reject password descriptors whose spinCount exceeds this value.
    #[arg(long, value_name = "N")]
    max_spin_count: Option<u32>,

    /// Log debug output to stderr (`RUST_LOG` takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn key_source(args: &mut Args) -> Result<KeySource> {
    if let Some(hex_key) = &args.secret_key {
        return KeySource::raw_key_from_hex(hex_key).context("invalid --secret-key");
    }
    if let Some(path) = &args.private_key {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read private key {}", path.display()))?;
        return KeySource::private_key_from_pem(&pem)
            .with_context(|| format!("failed to load private key {}", path.display()));
    }
    if let Some(password) = args.password.take() {
        return Ok(KeySource::password(password));
    }
    bail!("one of --secret-key, --private-key or --password is required")
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_logging(args.verbose);

    let options = DecryptOptions {
        truncate_to_declared_size: args.truncate,
        streaming: args.streaming,
        limits: DecryptLimits {
            max_spin_count: args
                .max_spin_count
                .or(DecryptLimits::default().max_spin_count),
        },
    };

    let mut file = EncryptedOfficeFile::open_path(&args.infile)
        .with_context(|| format!("failed to open {}", args.infile.display()))?;
    file.decryptor_mut().set_options(options);

    let source = key_source(&mut args)?;
    file.load_key_source(&source)
        .with_context(|| format!("failed to derive the package key from the {}", source.kind()))?;

    let written = match &args.outfile {
        Some(path) => {
            let out = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut out = BufWriter::new(out);
            let written = file
                .decrypt_to(&mut out)
                .context("failed to decrypt EncryptedPackage")?;
            out.flush()?;
            written
        }
        None => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let written = file
                .decrypt_to(&mut out)
                .context("failed to decrypt EncryptedPackage")?;
            out.flush()?;
            written
        }
    };
    log::debug!("wrote {written} decrypted bytes");

    Ok(())
}
