//! Ed25519 keypair generation tool for MUC owners.
//!
//! Writes the 32-byte seed and prints the public key (which is also the
//! cube key every version of the MUC will live under).
//!
//! Usage:
//!   cargo run --bin keygen -- --output ./muc.seed

use clap::Parser;
use cubenet::crypto::Keypair;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Generate a MUC owner keypair")]
struct Args {
    /// File to write the 32-byte secret seed to
    #[arg(short, long, default_value = "./muc.seed")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    let mut seed = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
    let keypair = Keypair::from_seed(&seed);

    if let Err(e) = std::fs::write(&args.output, seed) {
        eprintln!("cannot write {}: {}", args.output.display(), e);
        std::process::exit(1);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&args.output, std::fs::Permissions::from_mode(0o600));
    }

    println!("seed written to {}", args.output.display());
    println!("public key / cube key: {}", hex::encode(keypair.public_key()));
}
