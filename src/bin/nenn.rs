//! Nenn CLI
//!
//! Runs exported detection and segmentation models on image files using
//! the ONNX Runtime or Tract backend.

#[cfg(feature = "cli")]
use nenn::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
