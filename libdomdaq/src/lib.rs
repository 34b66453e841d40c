//! # domdaq
//!
//! domdaq is a reader for IceCube DOM data acquisition output, written in Rust. It
//! decodes the binary payload streams written by the string processors, event builder
//! and trigger handlers, expands delta-compressed and engineering-format DOM hits, and
//! translates DOM clock times into surface (DOR) time using RAPCal time calibration
//! records.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, you will
//! most likely need to install the Rust tool chain. See the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! domdaq has no system dependencies. Build with `cargo build --release` from the top
//! level of the repository.
//!
//! ## Use
//!
//! domdaq is split into a library (`libdomdaq`) and a command line frontend
//! (`domdaq_cli`). To make a template configuration run
//!
//! ```bash
//! cargo run --release -p domdaq_cli -- -p <your_config.yml> new
//! ```
//!
//! then edit it and run
//!
//! ```bash
//! cargo run --release -p domdaq_cli -- -p <your_config.yml>
//! ```
//!
//! The configuration is YAML:
//!
//! ```yml
//! payload_paths: []
//! tcal_path: null
//! tcal_format: 1
//! year: 1970
//! hit_path: null
//! decode_waveforms: false
//! max_records: null
//! summary_path: null
//! ```
//!
//! - `payload_paths`: payload files to read, in order
//! - `tcal_path` (Optional): a file of RAPCal records. Without it hits are not calibrated
//! - `tcal_format`: layout of the RAPCal file. 0 is the legacy fixed record, 1 the South
//! Pole fixed record with a GPS block, 2 the DOMHub stream with per-record headers
//! - `year`: the GPS string does not carry a year, so this one is assumed
//! - `hit_path` (Optional): a flat TestDAQ hit file, merged with the hits from events
//! - `decode_waveforms`: expand the waveforms of every delta-compressed hit
//! - `max_records` (Optional): stop each payload file after this many payloads
//! - `summary_path` (Optional): write the run summary as YAML to this path
//!
//! ## Library
//!
//! The pieces are usable on their own:
//!
//! - [`payload_reader`] decodes a byte stream into [`payload::Payload`] values. Unknown
//! payload types come back as opaque payloads and do not end the stream.
//! - [`slc_hit`] and [`delta_codec`] decode delta-compressed hits and their waveforms.
//! - [`hits`] decodes engineering-format hits.
//! - [`hit_stream`] reads TestDAQ hit files.
//! - [`rapcal`] and [`time_calibrator`] hold RAPCal records and translate DOM clocks to
//! DOR clocks and GPS time.
//!
//! ```no_run
//! use libdomdaq::payload_reader::read_payloads;
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! let file = BufReader::new(File::open("physics_110000_0.dat").unwrap());
//! for payload in read_payloads(file) {
//!     println!("{}", payload.unwrap());
//! }
//! ```
//!
//! ## Times
//!
//! Payload and hit UTC stamps are in units of 0.1 ns. DOM clocks tick at 40 MHz (25 ns),
//! DOR clocks at 20 MHz (50 ns). RAPCal translates a DOM clock into DOR units of 0.1 ns
//! and ties it to the GPS string latched by the DOR card.
//!
//! ## Output
//!
//! The CLI logs a summary of the run: event count, run length and rates per trigger type.
//! When `summary_path` is set the complete summary, including per-DOM hit and beacon
//! rates, is written as YAML.
pub mod config;
pub mod constants;
pub mod delta_codec;
pub mod error;
pub mod hit_stream;
pub mod hits;
pub mod payload;
pub mod payload_reader;
pub mod process;
pub mod rapcal;
pub mod slc_hit;
pub mod source_id;
pub mod time_calibrator;
pub mod worker_status;
