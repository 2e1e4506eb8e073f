use backchannel::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    let _telemetry_guard = init_tracing(cli.verbose);

    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) -> telemetry::TelemetryGuard {
    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            config::Config::default()
        }
    };
    telemetry::init(telemetry::TelemetryConfig::new(verbose, cfg.logging))
}
