//! # fff_daq
//!
//! fff_daq is a file-based data acquisition harness, written in Rust. A builder unit (BU)
//! writes raw event files into a run directory on a shared disk, and one or more filter
//! units (FU) claim those files, read the events back through a small pool of large
//! memory chunks, and run every event through a set of processing paths. Events accepted
//! by a path are handed to the outputs that selected it.
//!
//! ## Installation
//!
//! Currently the only method of install is from source.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./fff_daq_cli` from the top
//! level repository. The binary is installed to your cargo install location (typically
//! something like `~/.cargo/bin/`). To use the CLI see the `fff_daq_cli` help.
//!
//! ## How a run flows
//!
//! 1. The BU creates `{bu_base}/run{NNNNNN}` and, for each raw file, writes the data
//! under `open/` before renaming it into the run directory. A `.ready` marker follows
//! the same route, so a marker is only ever visible next to a complete file.
//! 2. An FU polls the run directory with a capped exponential backoff. It claims the
//! oldest ready file by renaming its marker to `.claimed`. When two FUs race for a file,
//! exactly one rename succeeds; the loser simply looks again.
//! 3. The claimed file is read block by block into chunks taken from a fixed pool. An
//! event never straddles two chunks: a partial event at the end of a chunk is carried
//! into the next one. Events are checked against their adler32 and crc32 checksums.
//! 4. Each worker stream takes the next event from the shared source and runs it
//! through every path. A prescale step admits one event in N per path, with N taken
//! from the current L1 label's column of the prescale table.
//! 5. The run ends once the BU has written `run{NNNNNN}_EoR.marker` and no ready files
//! remain. The streams then finish, the outputs are closed and the run summary is
//! written.
//!
//! Setting `director_is_bu` makes the process the producer instead. Setting
//! `test_mode_no_builder_unit` makes an FU generate its own synthetic run under
//! `{fu_base}/testmode` first, so it can be exercised without any BU at all.
//!
//! ## Configuration
//!
//! Configuration is a YAML file. A template with the standard two path setup can be made
//! with `fff_daq_cli new -p config.yml`:
//!
//! ```yml
//! run_number: 100
//! fff_base_dir: .
//! bu_base_dir: ramdisk
//! fu_base_dir: data
//! n_threads: 2
//! n_streams: 2
//! director:
//!   director_is_bu: false
//!   test_mode_no_builder_unit: false
//! source:
//!   get_ls_from_filename: true
//!   verify_adler32: true
//!   verify_checksum: true
//!   use_l1_event_id: true
//!   event_chunk_size: 16
//!   num_buffers: 2
//!   event_chunk_block: 1
//!   checksum_policy: abort
//!   delete_consumed_files: false
//! prescale:
//!   force_default: false
//!   prescale_table:
//!   - path_name: p1
//!     prescales: [10]
//!   - path_name: p2
//!     prescales: [100]
//!   lvl1_default_label: Default
//!   lvl1_labels: [Default]
//! paths:
//! - name: p1
//!   steps:
//!   - kind: delay
//!     millis: 58
//!   - kind: prescale
//! outputs:
//! - name: streamA
//!   kind: file
//!   select_events: [p1]
//! ```
//!
//! Chunk sizes (`event_chunk_size`, `event_chunk_block`) are given in MB. The pool holds
//! exactly `num_buffers` chunks; a chunk stays pinned while any event carved from it is
//! alive.
//!
//! ## Output
//!
//! Each file output writes `run{NNNNNN}_stream{Name}.dat` to the FU run directory, in
//! the same raw format the BU produces, and a `run{NNNNNN}_stream{Name}.yml` file with
//! its event counts per path.
//!
//! The run summary `run{NNNNNN}_summary.yml` records the per stream counts, the per
//! path accept counts, source statistics and the run state transitions.
//!
//! ### Raw Data Format
//!
//! ```text
//! file header (24 bytes): magic "FFFRAW01", version, reserved, run, lumisection, event count
//! |---- event header (28 bytes): version, flags, run, lumisection, l1 id, size, adler32, crc32
//! |---- payload (size bytes)
//! |---- ...
//! ```
//!
//! All fields are little endian.
pub mod backoff;
pub mod chunk_pool;
pub mod config;
pub mod constants;
pub mod director;
pub mod error;
pub mod frd;
pub mod handoff;
pub mod output;
pub mod prescaler;
pub mod process;
pub mod raw_file;
pub mod run_control;
pub mod schedule;
pub mod source;
pub mod worker_status;
