use tokio_util::sync::CancellationToken;

use lmstrix::backend::http::HttpBackend;
use lmstrix::config::Config;
use lmstrix::tester::TestOptions;
use lmstrix::Toolkit;

fn print_usage() {
    eprintln!(
        "usage: lmstrix <scan|list|test <id>|test-fleet> [--target N] [--reset]"
    );
}

fn parse_flags(args: &[String]) -> (Option<u64>, bool) {
    let mut target = None;
    let mut reset = false;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--target" => {
                target = args.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "--reset" => {
                reset = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    (target, reset)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        std::process::exit(2);
    };

    let config = Config::from_env();
    let backend = HttpBackend::new(config.base_url.clone(), config.api_key.clone());
    let mut toolkit = Toolkit::open(backend, config.registry_path.clone()).await?;
    let cancel = CancellationToken::new();

    match command.as_str() {
        "scan" => {
            let n = toolkit.scan().await?;
            println!("{n}");
        }
        "list" => {
            let records = toolkit.list();
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        "test" => {
            let identifier = args.get(1).ok_or_else(|| {
                anyhow::anyhow!("usage: lmstrix test <id> [--target N] [--reset]")
            })?;
            let (target, reset) = parse_flags(&args[2..]);
            let options = TestOptions {
                target,
                reset,
                ..config.test_options()
            };
            let record = toolkit.test_one(identifier, &options, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        "test-fleet" => {
            let (target, reset) = parse_flags(&args[1..]);
            let options = TestOptions {
                target,
                reset,
                ..config.test_options()
            };
            let records = toolkit.test_fleet(&options, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_usage();
            std::process::exit(2);
        }
    }

    Ok(())
}
