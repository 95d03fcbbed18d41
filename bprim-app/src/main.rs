//! bprim trainer
//!
//! Fits boundary primitives to a set of calibrated images. Loads the scene,
//! seeds patches from the point cloud and runs the adaptive training
//! controller with the reference CPU backends. A viewer can connect over TCP
//! to watch and steer the run.

mod app;
mod cli;
mod error;
mod remote;
mod render;
mod report;
mod scene;

use clap::Parser;

fn main() {
    let args = cli::Args::parse();

    if let Err(e) = app::run(args) {
        eprintln!("Application error: {}", e);
        std::process::exit(1);
    }
}
