use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use libdomdaq::config::Config;
use libdomdaq::process::{process, RunSummary};
use libdomdaq::worker_status::{BarColor, WorkerStatus};

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

fn bar_style(color: BarColor) -> ProgressStyle {
    let color = match color {
        BarColor::CYAN => "cyan",
        BarColor::MAGENTA => "magenta",
        BarColor::RED => "red",
        BarColor::GREEN => "green",
    };
    ProgressStyle::with_template(&format!(
        "{{msg}} [{{bar:40.{color}/blue}}] {{pos:>3}}%"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn update_bar(pb: &ProgressBar, status: &WorkerStatus, n_files: usize) {
    pb.set_style(bar_style(status.color));
    if status.file_index < n_files {
        pb.set_message(format!("File {}/{}", status.file_index + 1, n_files));
    } else {
        pb.set_message("Hits");
    }
    pb.set_position((status.progress * 100.0) as u64);
}

fn report(summary: &RunSummary) {
    for file in &summary.files {
        match &file.error {
            Some(e) => log::warn!(
                "{}: {} payloads before error: {e}",
                file.path.to_string_lossy(),
                file.payloads
            ),
            None => log::info!(
                "{}: {} payloads, {} events",
                file.path.to_string_lossy(),
                file.payloads,
                file.events
            ),
        }
        if file.record_errors > 0 {
            log::warn!(
                "{}: skipped {} undecodable records",
                file.path.to_string_lossy(),
                file.record_errors
            );
        }
    }
    log::info!(
        "{} events over {:.1} s ({:.3} Hz)",
        summary.events,
        summary.run_length,
        summary.event_rate
    );
    for (trigger_type, count) in &summary.triggers {
        let rate = summary.trigger_rates.get(trigger_type).copied().unwrap_or(0.0);
        log::info!("Trigger type {trigger_type}: {count} ({rate:.3} Hz)");
    }
    log::info!(
        "{} hits from {} DOMs",
        summary.total_hits,
        summary.doms.len()
    );
    if summary.hit_failures > 0 {
        log::warn!("{} hits could not be decoded", summary.hit_failures);
    }
    if summary.waveform_failures > 0 {
        log::warn!("{} waveforms failed to decode", summary.waveform_failures);
    }
    if summary.calibration_failures > 0 {
        log::warn!("{} hits could not be calibrated", summary.calibration_failures);
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("domdaq_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );

        make_template_config(&config_path);
        log::info!("Done.");
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    for path in &config.payload_paths {
        log::info!("Payload file: {}", path.to_string_lossy());
    }
    match &config.tcal_path {
        Some(path) => log::info!(
            "RAPCal file: {} (format {})",
            path.to_string_lossy(),
            config.tcal_format
        ),
        None => log::info!("No RAPCal file, hits will not be calibrated"),
    }
    if let Some(path) = &config.hit_path {
        log::info!("TestDAQ hit file: {}", path.to_string_lossy());
    }
    log::info!("GPS year: {}", config.year);

    // Setup the progress bar
    let n_files = config.payload_paths.len();
    let pb = pb_manager.add(ProgressBar::new(100));
    pb.set_style(bar_style(BarColor::default()));
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(config, tx));

    loop {
        // No UI here, so sleep for ~ 1 sec before draining the status queue
        std::thread::sleep(std::time::Duration::from_secs(1));
        while let Ok(status) = rx.try_recv() {
            update_bar(&pb, &status, n_files);
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(summary) => {
                        pb.finish();
                        report(&summary);
                    }
                    Err(e) => {
                        pb.abandon();
                        log::error!("Processing failed with error: {e}");
                    }
                },
                Err(_) => log::error!("Failed to join processing task!"),
            }
            break;
        }
    }

    log::info!("Done.");
}
