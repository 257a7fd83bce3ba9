use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tsmon::pcr::PcrAnalyzer;
use tsmon::psi::table::{Eit, Pat, Pmt};
use tsmon::psi::{Decoder, PsiError, Subtables};
use tsmon::Pid;

#[derive(Debug)]
struct AppArgs {
    path: PathBuf,
    bitrate: u64,
}

impl AppArgs {
    const HELP: &str = "\
PSI/SIとPCRを監視するコマンド

USAGE:
  monitor [OPTIONS] [PATH]

FLAGS:
  -h, --help          このヘルプを表示する

OPTIONS:
  --bitrate <BPS>     到着時刻の計算に使うビットレート [default: 20000000]

ARGS:
  <PATH>              監視するTSファイルのパス
";

    pub fn parse() -> Result<AppArgs, Box<dyn std::error::Error>> {
        let mut args = pico_args::Arguments::from_env();

        if args.contains(["-h", "--help"]) {
            print!("{}", Self::HELP);
            std::process::exit(0);
        }

        let bitrate = args
            .opt_value_from_str("--bitrate")?
            .unwrap_or(20_000_000_u64)
            .max(1);

        Ok(AppArgs {
            path: args.free_from_str()?,
            bitrate,
        })
    }
}

#[derive(Debug, Default)]
struct PcrSummary {
    count: u64,
    max_jitter: i64,
    max_accuracy: i64,
    max_interval: i64,
}

#[derive(Default)]
struct State {
    pmt_pids: Vec<(u16, Pid)>,
    pcr_pids: Vec<Pid>,
    events: u64,
}

fn drain(analyzer: &PcrAnalyzer, summaries: &mut FxHashMap<Pid, PcrSummary>) {
    for pid in analyzer.pcr_pids() {
        let Some(info) = analyzer.lock_pcr_info(pid) else {
            continue;
        };
        let summary = summaries.entry(pid).or_default();
        for m in info.iter() {
            summary.count += 1;
            summary.max_jitter = summary.max_jitter.max(m.jitter.abs());
            if let Some(accuracy) = m.accuracy {
                summary.max_accuracy = summary.max_accuracy.max(accuracy.abs());
            }
            if let Some(interval) = m.interval {
                summary.max_interval = summary.max_interval.max(interval);
            }
        }
    }

    for sample in analyzer.lock_rate().iter() {
        println!("{:>10.3}s : {:12} bps", sample.arrival.as_secs_f64(), sample.bitrate);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = AppArgs::parse()?;

    env_logger::init();

    let f = File::open(&args.path)?;
    let f = BufReader::with_capacity(188 * 1024, f);

    let state = Arc::new(Mutex::new(State::default()));
    let analyzer = PcrAnalyzer::new();
    let mut decoders: FxHashMap<Pid, Decoder> = FxHashMap::default();

    let mut pat_decoder = Decoder::new();
    pat_decoder.set_new_subtable_handler({
        let state = state.clone();
        move |subtables: &mut Subtables, table_id: u8, extension: u16| {
            if table_id != Pat::TABLE_ID {
                return;
            }
            let state = state.clone();
            let _ = subtables.attach(table_id, extension, move |pat: Pat| {
                log::info!("PAT: transport_stream_id {}", pat.transport_stream_id);
                state.lock().pmt_pids = pat
                    .programs
                    .iter()
                    .filter(|p| p.program_number != 0)
                    .map(|p| (p.program_number, p.pid))
                    .collect();
            });
        }
    });
    decoders.insert(Pid::PAT, pat_decoder);

    let mut eit_decoder = Decoder::new();
    eit_decoder.set_new_subtable_handler({
        let state = state.clone();
        move |subtables: &mut Subtables, table_id: u8, extension: u16| {
            if !Eit::is_eit(table_id) {
                return;
            }
            let state = state.clone();
            let _ = subtables.attach(table_id, extension, move |eit: Eit| {
                state.lock().events += eit.events.len() as u64;
            });
        }
    });
    decoders.insert(Pid::EIT, eit_decoder);

    let mut summaries = FxHashMap::default();
    let mut bytes = 0_u64;
    for (i, packet) in tsmon::Packet::iter(f).enumerate() {
        let packet = packet?;
        let arrival = Duration::from_nanos(
            (bytes as u128 * 8 * 1_000_000_000 / args.bitrate as u128) as u64,
        );
        bytes += packet.0.len() as u64;

        if let Some(decoder) = decoders.get_mut(&packet.pid()) {
            match decoder.packet_push(&packet) {
                Ok(_) => {}
                Err(e @ PsiError::NotATsPacket) => log::debug!("{}", e),
                Err(e) => return Err(e.into()),
            }
        }
        analyzer.process_buffer(&packet.0, arrival);

        // PATやPMTで見つかったPIDを監視対象に加える
        let mut found = state.lock();
        for (program_number, pid) in std::mem::take(&mut found.pmt_pids) {
            // 複数の番組が同じPIDでPMTを送ることもある
            let decoder = decoders.entry(pid).or_default();
            let shared = state.clone();
            let attached = decoder.attach(Pmt::TABLE_ID, program_number, move |pmt: Pmt| {
                shared.lock().pcr_pids.push(pmt.pcr_pid);
            });
            match attached {
                Ok(()) => log::debug!("PMT: program {} on {:?}", program_number, pid),
                Err(PsiError::AlreadyAttached { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        for pid in std::mem::take(&mut found.pcr_pids) {
            if pid != Pid::NULL && analyzer.add_pcr_pid(pid) {
                log::info!("PCR PID: {:?}", pid);
            }
        }
        drop(found);

        if i % 10_000 == 0 {
            drain(&analyzer, &mut summaries);
        }
    }
    drain(&analyzer, &mut summaries);

    println!();
    println!(" PID :   PSI Packets  Sections    Tables   Dropped  CRC Error");
    let mut pids: Vec<_> = decoders.keys().copied().collect();
    pids.sort();
    for pid in pids {
        let stats = decoders[&pid].stats();
        println!(
            "{:04X} : {:13} {:9} {:9} {:9} {:10}",
            pid,
            stats.packets,
            stats.sections,
            stats.tables,
            stats.discontinuities,
            stats.crc_errors,
        );
    }

    println!();
    println!(" PID :  PCR Count  Max Jitter(us)  Max Accuracy(us)  Max Interval(ms)");
    for (pid, summary) in &summaries {
        println!(
            "{:04X} : {:10} {:15} {:17} {:17}",
            pid,
            summary.count,
            summary.max_jitter,
            summary.max_accuracy,
            summary.max_interval,
        );
    }

    println!();
    println!("EIT Events : {}", state.lock().events);

    Ok(())
}
