use clap::Parser;
use mongo_replicator::{ReplicationCoordinator, ReplicatorConfig};
use std::path::Path;

#[derive(Parser, Debug)]
#[command(version, about = "MongoDB change-data-capture replicator")]
struct Opts {
    /// configuration file path.
    #[arg(short, long, default_value = "replicator.toml")]
    conf: String,
    /// log file path, if not specified, all log output goes to stdout.
    #[arg(long)]
    log_path: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();

    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match &opts.log_path {
        Some(path) => {
            let path = Path::new(path);
            let dir_name = path.parent().expect("log path needs a parent directory");
            let file_name = path
                .file_name()
                .and_then(|f| f.to_str())
                .expect("log path needs a file name");
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let data = std::fs::read_to_string(&opts.conf)?;
    let config: ReplicatorConfig = toml::from_str(&data)?;

    let mut coordinator = ReplicationCoordinator::new(config)?;
    coordinator.run()?;
    Ok(())
}
