#![forbid(unsafe_code)]
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{error, info, warn};

use clap::{self, Arg};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use recover_config::{ConfigError, RecoverConfig, DEFAULT_NTADDRS, DEFAULT_NZADDRS};
use recover_netutils::{RpcConnector, RpcError};
use recover_sync::error::RunError;
use recover_sync::primitives::{RunEvent, RunOutcome, ScanParameters};
use recover_sync::validation::LocalValidator;
use recover_sync::{RegressionPolicy, ScanOrchestrator};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_LWD_URL: &str = "https://zec.rocks";

const SEED_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

pub fn build_clap_app() -> clap::Command {
    clap::Command::new("zwl-recover").version(VERSION)
            .about("Scans a seed's addresses with a remote scan service and sweeps the funds found to a destination address.")
            .arg(Arg::new("seed")
                .long("seed")
                .value_name("seed")
                .required(true)
                .value_parser(parse_seed)
                .help("BIP-39 recovery phrase of the wallet to recover, 12 to 24 words."))
            .arg(Arg::new("destination")
                .long("destination")
                .value_name("destination")
                .required(true)
                .help("Address receiving the swept funds."))
            .arg(Arg::new("ntaddrs")
                .long("ntaddrs")
                .value_name("ntaddrs")
                .value_parser(clap::value_parser!(u32))
                .default_value("5")
                .help("Number of transparent addresses to derive."))
            .arg(Arg::new("nzaddrs")
                .long("nzaddrs")
                .value_name("nzaddrs")
                .value_parser(clap::value_parser!(u32))
                .default_value("3")
                .help("Number of shielded addresses to derive."))
            .arg(Arg::new("birth-height")
                .long("birth-height")
                .value_name("birth-height")
                .required(true)
                .value_parser(clap::value_parser!(u32))
                .help("Block height to start scanning from. This should be the earliest height where the wallet has a transaction."))
            .arg(Arg::new("lwd-url")
                .long("lwd-url")
                .value_name("lwd-url")
                .value_parser(parse_uri)
                .default_value(DEFAULT_LWD_URL)
                .help("Lightwalletd server the scan service syncs from."))
            .arg(Arg::new("service")
                .long("service")
                .value_name("service")
                .value_parser(parse_uri)
                .default_value(recover_config::DEFAULT_SCAN_SERVICE)
                .help("JSON-RPC endpoint of the scan service."))
            .arg(Arg::new("data-dir")
                .long("data-dir")
                .value_name("data-dir")
                .help("Absolute path to use as data directory for logs"))
            .arg(Arg::new("target-ms")
                .long("target-ms")
                .value_name("target-ms")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Target duration of a single scan step in milliseconds."))
            .arg(Arg::new("initial-batch")
                .long("initial-batch")
                .value_name("initial-batch")
                .value_parser(clap::value_parser!(u32).range(1..))
                .help("Number of blocks requested by the first scan step."))
            .arg(Arg::new("call-timeout-secs")
                .long("call-timeout-secs")
                .value_name("call-timeout-secs")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Give up on any single call to the scan service after this many seconds."))
            .arg(Arg::new("strict-cursor")
                .long("strict-cursor")
                .help("Fail the run when the scan service reports a lower height than before.")
                .action(clap::ArgAction::SetTrue))
            .arg(Arg::new("offline-validation")
                .long("offline-validation")
                .help("Check the seed and destination locally instead of asking the scan service.")
                .action(clap::ArgAction::SetTrue))
}

// Custom function to parse a string into an http::Uri
fn parse_uri(s: &str) -> Result<http::Uri, String> {
    s.parse::<http::Uri>().map_err(|e| e.to_string())
}

fn parse_seed(s: &str) -> Result<String, String> {
    let count = s.split_whitespace().count();
    if SEED_WORD_COUNTS.contains(&count) {
        Ok(s.split_whitespace().collect::<Vec<_>>().join(" "))
    } else {
        Err(format!(
            "Expected 12, 15, 18, 21 or 24 words, but received: {}.",
            count
        ))
    }
}

fn report_permission_error(config: &RecoverConfig) {
    let user = std::env::var("USER").unwrap_or_else(|_| "<unknown>".to_string());
    eprintln!("USER: {}", user);
    if let Ok(executable) = std::env::current_exe() {
        eprintln!("Executable: {}", executable.display());
    }
    match &config.data_dir {
        Some(dir) => eprintln!(
            "User {} must have permission to write to '{}'.",
            user,
            dir.display()
        ),
        None => eprintln!(
            "User {} must have permission to write to '~/{}'.",
            user,
            recover_config::DEFAULT_DATA_DIR_NAME
        ),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateFillError {
    #[error("Missing argument {0}")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Everything a run needs, filled in from the command line.
pub struct ConfigTemplate {
    seed: SecretString,
    destination: String,
    ntaddrs: u32,
    nzaddrs: u32,
    birth_height: u32,
    offline_validation: bool,
    config: RecoverConfig,
}

impl ConfigTemplate {
    pub fn fill(matches: clap::ArgMatches) -> Result<Self, TemplateFillError> {
        let seed = matches
            .get_one::<String>("seed")
            .ok_or(TemplateFillError::MissingArgument("seed"))?;
        let destination = matches
            .get_one::<String>("destination")
            .ok_or(TemplateFillError::MissingArgument("destination"))?
            .trim()
            .to_string();
        let birth_height = *matches
            .get_one::<u32>("birth-height")
            .ok_or(TemplateFillError::MissingArgument("birth-height"))?;
        let ntaddrs = matches
            .get_one::<u32>("ntaddrs")
            .copied()
            .unwrap_or(DEFAULT_NTADDRS);
        let nzaddrs = matches
            .get_one::<u32>("nzaddrs")
            .copied()
            .unwrap_or(DEFAULT_NZADDRS);

        let service = matches
            .get_one::<http::Uri>("service")
            .map(|uri| uri.to_string());
        let lightwalletd = matches
            .get_one::<http::Uri>("lwd-url")
            .map(|uri| uri.to_string());
        let data_dir = matches.get_one::<String>("data-dir").map(PathBuf::from);
        let mut config = RecoverConfig::create(service, lightwalletd, data_dir)?;

        if let Some(target_ms) = matches.get_one::<u64>("target-ms") {
            config.pacing.target = Duration::from_millis(*target_ms);
        }
        if let Some(initial_batch) = matches.get_one::<u32>("initial-batch") {
            config.pacing.initial_batch_size = *initial_batch;
        }
        config.call_timeout = matches
            .get_one::<u64>("call-timeout-secs")
            .map(|secs| Duration::from_secs(*secs));
        if matches.get_flag("strict-cursor") {
            config.regression_policy = RegressionPolicy::Fail;
        }

        Ok(Self {
            seed: SecretString::new(seed.clone()),
            destination,
            ntaddrs,
            nzaddrs,
            birth_height,
            offline_validation: matches.get_flag("offline-validation"),
            config,
        })
    }

    pub fn config(&self) -> &RecoverConfig {
        &self.config
    }

    fn scan_parameters(&self) -> ScanParameters {
        ScanParameters::new(
            SecretString::new(self.seed.expose_secret().clone()),
            self.destination.clone(),
            self.ntaddrs,
            self.nzaddrs,
            self.birth_height,
            self.config.lwd_url(),
        )
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Could not start the async runtime. {0}")]
    Runtime(#[from] std::io::Error),
    #[error("Could not build the scan service client. {0}")]
    Connector(#[from] RpcError),
    #[error(transparent)]
    Run(#[from] RunError),
}

fn init_logging(config: &RecoverConfig) -> Result<(), ConfigError> {
    let log_config = config.get_log_config()?;
    log4rs::init_config(log_config).map_err(|e| ConfigError::Log(e.to_string()))?;
    Ok(())
}

fn report(event: RunEvent) {
    match event {
        RunEvent::Progress { cursor, .. } => println!("Height: {}", cursor),
        RunEvent::StateChanged(state) => info!("Run state: {}", state),
        RunEvent::BatchResized { from, to } => info!("Batch size {} -> {}", from, to),
        RunEvent::CursorRegressed { previous, current } => {
            warn!("Height went back from {} to {}", previous, current)
        }
    }
}

async fn recover(template: &ConfigTemplate) -> Result<RunOutcome, CliError> {
    let connector = RpcConnector::new(template.config.service_uri.clone())?;
    let remote_validator = connector.clone();
    let params = template.scan_parameters();

    let (event_sender, mut event_receiver) = mpsc::unbounded_channel();
    let mut orchestrator = ScanOrchestrator::new(connector, template.config.orchestrator_settings())
        .with_events(event_sender);

    let interrupt = orchestrator.interrupt_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping after the current call.");
            interrupt.store(true, Ordering::Release);
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(event) = event_receiver.recv().await {
            report(event);
        }
    });

    let result = if template.offline_validation {
        orchestrator.start_validated(&LocalValidator, params).await
    } else {
        orchestrator.start_validated(&remote_validator, params).await
    };
    drop(orchestrator);
    ctrl_c.abort();
    if let Err(e) = printer.await {
        warn!("Progress printer stopped early: {}", e);
    }

    Ok(result?)
}

pub fn run_cli() -> ExitCode {
    let template = match ConfigTemplate::fill(build_clap_app().get_matches()) {
        Ok(template) => template,
        Err(e) => {
            eprintln!("Error filling config template: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(template.config()) {
        eprintln!("Could not initialize logging: {e}");
        if matches!(e, ConfigError::Io(_)) {
            report_permission_error(template.config());
        }
    }
    info!(
        "Recovering from birth height {} via {}",
        template.birth_height, template.config.service_uri
    );

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::from)
        .and_then(|runtime| runtime.block_on(recover(&template)));

    match result {
        Ok(outcome) => {
            println!(
                "Swept to {} at end height {}. {} scan steps in {:.1?}, last batch size {}.",
                template.destination,
                outcome.end_height(),
                outcome.iterations(),
                outcome.elapsed(),
                outcome.final_batch_size()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            if let CliError::Run(run_error) = &e {
                if let Some(end_height) = run_error.end_height() {
                    eprintln!("Last end height: {}", end_height);
                }
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use recover_sync::error::ValidationFailure;

    use super::*;

    const SEED: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn fill(extra: &[&str]) -> Result<ConfigTemplate, String> {
        let mut args = vec![
            "zwl-recover",
            "--seed",
            SEED,
            "--destination",
            "u1dest",
            "--birth-height",
            "2757209",
        ];
        args.extend_from_slice(extra);
        let matches = build_clap_app()
            .try_get_matches_from(args)
            .map_err(|e| e.to_string())?;
        ConfigTemplate::fill(matches).map_err(|e| e.to_string())
    }

    #[test]
    fn seed_word_counts() {
        assert!(parse_seed(SEED).is_ok());
        assert!(parse_seed(&[SEED, SEED].join(" ")).is_ok());
        assert!(parse_seed("abandon abandon about").is_err());
        assert_eq!(
            parse_seed("  abandon\tabandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about ")
                .unwrap(),
            SEED
        );
    }

    #[test]
    fn defaults_match_the_backend() {
        let template = fill(&[]).unwrap();
        assert_eq!(template.ntaddrs, 5);
        assert_eq!(template.nzaddrs, 3);
        assert!(!template.offline_validation);

        let params = template.scan_parameters();
        assert_eq!(params.birth_height(), 2_757_209);
        assert_eq!(params.lwd_url(), "https://zec.rocks:443");
        assert_eq!(params.end_height(), None);
        assert_eq!(template.config().regression_policy, RegressionPolicy::Continue);
        assert_eq!(template.config().call_timeout, None);
    }

    #[test]
    fn tunables_reach_the_config() {
        let template = fill(&[
            "--target-ms",
            "2500",
            "--initial-batch",
            "50",
            "--call-timeout-secs",
            "90",
            "--strict-cursor",
            "--offline-validation",
            "--lwd-url",
            "na.zec.rocks:9067",
        ])
        .unwrap();

        let config = template.config();
        assert_eq!(config.pacing.target, Duration::from_millis(2_500));
        assert_eq!(config.pacing.initial_batch_size, 50);
        assert_eq!(config.call_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.regression_policy, RegressionPolicy::Fail);
        assert_eq!(config.lwd_url(), "http://na.zec.rocks:9067");
        assert!(template.offline_validation);
    }

    #[test]
    fn birth_height_is_required() {
        let error = build_clap_app()
            .try_get_matches_from(["zwl-recover", "--seed", SEED, "--destination", "u1dest"])
            .unwrap_err();
        assert_eq!(
            error.kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn zero_initial_batch_is_rejected() {
        assert!(fill(&["--initial-batch", "0"]).is_err());
    }

    #[test]
    fn service_host_gets_a_scheme() {
        let template = fill(&["--service", "httpbin.local:8234"]).unwrap();
        assert_eq!(template.config().service_uri.scheme_str(), Some("http"));
        assert_eq!(template.config().service_uri.port_u16(), Some(8234));
    }

    #[test]
    fn error_messages() {
        let connector = CliError::from(RpcError::InvalidRequest("bad uri".to_string()));
        assert!(connector
            .to_string()
            .starts_with("Could not build the scan service client."));

        let rejected = CliError::from(RunError::Validation(ValidationFailure::InvalidAddress));
        assert!(rejected.to_string().contains("Invalid address"));
    }
}
