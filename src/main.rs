use clap::Parser;

use heronmq::cli::{run, Args};
use heronmq::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    run::main(args)
}
