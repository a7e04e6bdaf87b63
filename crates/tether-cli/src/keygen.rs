//! Static key generation and key files.
//!
//! A key file holds the hex-encoded private scalar and nothing else. The
//! private half is only ever written to a file, never to the terminal.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zeroize::Zeroizing;

use tether_crypto::KeyPair;

#[derive(clap::Args, Debug)]
pub struct KeygenArgs {
    /// Write the private key to this file (created, never overwritten)
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

pub fn run(args: KeygenArgs) -> Result<()> {
    let keypair = KeyPair::generate();
    if let Some(path) = &args.out {
        write_key_file(path, &keypair)?;
    }
    print!("{}", describe(&keypair, args.out.as_deref()));
    Ok(())
}

/// What keygen shows: public material only.
fn describe(keypair: &KeyPair, written_to: Option<&Path>) -> String {
    let mut report = format!(
        "Public key:  {}\nFingerprint: {}\n",
        hex::encode(keypair.public_key()),
        tether_common::key_fingerprint(keypair.public_key())
    );
    match written_to {
        Some(path) => report.push_str(&format!("Private key: written to {}\n", path.display())),
        None => report.push_str("Private key: discarded (use --out to keep it)\n"),
    }
    report
}

pub fn write_key_file(path: &Path, keypair: &KeyPair) -> Result<()> {
    let private = keypair
        .private_key()
        .context("key has been destroyed")?;
    let encoded = Zeroizing::new(hex::encode(private));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating key file {}", path.display()))?;
    writeln!(file, "{}", encoded.as_str())
        .with_context(|| format!("writing key file {}", path.display()))?;
    Ok(())
}

pub fn load_key_file(path: &Path) -> Result<KeyPair> {
    let contents = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("reading key file {}", path.display()))?,
    );
    let bytes = Zeroizing::new(
        hex::decode(contents.trim())
            .with_context(|| format!("key file {} is not hex", path.display()))?,
    );
    let private: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file {} does not hold 32 bytes", path.display()))?;
    Ok(KeyPair::from_private(private))
}
