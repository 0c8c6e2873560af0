use std::path::PathBuf;

pub mod run;

#[derive(clap::Parser, Clone, Debug)]
#[command(name = "heronmq", version, about = "An MQTT 3.1.1 broker with durable sessions")]
pub struct Args {
    /// Set the format of log output.
    #[clap(short, long, default_value = "full")]
    pub log: LogFormat,

    /// Path to the JSON configuration file.
    ///
    /// If the file does not exist a template is written there and the broker
    /// exits so the template can be filled in.
    #[clap(short, long, default_value = "config.json")]
    pub config: PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Full,
    Compact,
    Pretty,
    Json,
}
