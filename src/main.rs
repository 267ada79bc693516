use clap::Parser;
use std::thread::sleep;
use std::time::Duration;

use link_fault_injector::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Software fault injection campaign over a simulated ARINC-style serial link
///
fn main() -> Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=debug cargo run

    println!("--- Link fault injector: {GIT_VERSION} ---\n");

    let mut config = match &args.config {
        Some(path) => {
            println!("Provided config file: {}\n", path.display());
            Config::from_file(path).map_err(|e| e.to_string())?
        }
        None => Config::default(),
    };
    config.override_with_args(&args);

    let mut campaign = config.build_campaign().map_err(|e| e.to_string())?;

    println!(
        "Seed 0x{:08X}, mask 0x{:08X}, probability {}%, injection {}",
        config.seed,
        config.mask,
        config.probability,
        if config.enabled { "on" } else { "off" }
    );
    println!("Running campaign for {} ms\n", config.duration_ms);

    let result = match args.interactive {
        false => campaign.run_for(config.duration_ms, config.tick_ms),
        true => run_interactive(&mut campaign, &config),
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            println!("{}", campaign.report());
            return Err(e.to_string());
        }
    };

    println!("{report}");

    if args.dump_log {
        println!("\n{}", campaign.dump_log());
    }
    Ok(())
}

/// Runs the campaign on wall-clock ticks while control commands are read from stdin
fn run_interactive(campaign: &mut Campaign, config: &Config) -> Result<CampaignReport, LinkError> {
    let mut ticker = TickThread::start(TickClock::new(), config.tick_ms);
    let control = ControlThread::from_stdin();
    println!("Interactive mode: enter commands, e.g. 'dump' or 'arm rx every 50'\n");

    let mut last_step = None;
    loop {
        let now = ticker.clock().now_ms();
        if now >= config.duration_ms {
            break;
        }
        for command in control.drain() {
            match command.and_then(|command| campaign.apply(&command)) {
                Ok(reply) => println!("{reply}"),
                Err(e) => println!("error: {e}"),
            }
        }
        if control.is_finished() {
            println!("Control input closed at {now} ms");
            break;
        }
        if last_step != Some(now) {
            campaign.step(now)?;
            last_step = Some(now);
        }
        sleep(Duration::from_millis(1));
    }
    ticker.stop();
    Ok(campaign.report())
}
