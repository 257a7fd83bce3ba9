//! PCRのジッター・精度・間隔と、多重化ストリームのビットレートを計測する。
//!
//! [`PcrAnalyzer::process_buffer`]に到着時刻と共にバイト列を渡すと、
//! 監視しているPIDごとの計測値とビットレートの標本が上限付きのリストに追加される。
//! リストは[`PcrAnalyzer::lock_pcr_info`]や[`PcrAnalyzer::lock_rate`]で取得した
//! [`Drain`]を通して読み出し、[`Drain`]を解放した時点で空になる。

pub mod jitter;
pub mod rate;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxBuildHasher;
use indexmap::IndexMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::packet::{Packet, PACKET_SIZE};
use crate::pid::Pid;
use crate::time::{pcr_delta, pcr_signed_delta};

use self::jitter::{JitterModel, PcrOffsetJitter};
use self::rate::RateModel;

/// [`PcrAnalyzer`]の設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// 1パケットのバイト数。先頭188バイトをTSパケットとして扱う。
    pub packet_length: usize,
    /// ビットレートの標本を取る間隔。
    pub rate_interval: Duration,
    /// 計測値のリストの上限。超える際はリストを空にする。
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            packet_length: PACKET_SIZE,
            rate_interval: Duration::from_millis(1000),
            capacity: 100,
        }
    }
}

/// PCRを含むパケット1つ分の計測値。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrMeasurement {
    /// ジッター（マイクロ秒）。
    pub jitter: i64,
    /// レートモデルから外挿したPCRとの差（マイクロ秒）。外挿できない場合は`None`。
    pub accuracy: Option<i64>,
    /// 前回のPCRからの間隔（ミリ秒）。最初のPCRでは`None`。
    pub interval: Option<i64>,
    /// パケットの到着時刻。
    pub arrival: Duration,
}

/// ビットレートの標本。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    /// ビットレート（bps）。
    pub bitrate: u64,
    /// 標本を取った時刻。
    pub arrival: Duration,
}

/// 計測値のリストを排他的に借用し、解放時にリストを空にするガード。
///
/// 借用している間、[`PcrAnalyzer::process_buffer`]はこのリストへの追加を待つ。
/// 待っている間も内部のロックは保持しないため、ガードを持ったまま
/// [`PcrAnalyzer`]の他のメソッドを呼び出せる。
#[must_use = "リストはガードを解放した時点で空になる"]
pub struct Drain<T>(ArcMutexGuard<RawMutex, Vec<T>>);

impl<T> Drain<T> {
    /// リストを空にしてロックを解放する。
    #[inline]
    pub fn unlock(self) {}
}

impl<T> Deref for Drain<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T> Drop for Drain<T> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for Drain<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Drain").field(&&**self).finish()
    }
}

type SharedList<T> = Arc<Mutex<Vec<T>>>;

fn push_bounded<T>(list: &Mutex<Vec<T>>, item: T, capacity: usize) {
    let mut list = list.lock();
    if list.len() >= capacity {
        log::trace!("list is full, cleared {} items", list.len());
        list.clear();
    }
    list.push(item);
}

/// 監視するPIDごとの状態。
struct PcrTracker {
    previous: Option<u64>,
    rate: RateModel,
    jitter: Box<dyn JitterModel>,
}

impl PcrTracker {
    fn on_pcr(&mut self, pcr: u64, arrival: Duration) -> PcrMeasurement {
        let jitter = self.jitter.recv_pcr(pcr, arrival) / 1000;
        let accuracy = self
            .rate
            .estimate()
            .map(|estimate| pcr_signed_delta(estimate, pcr) / 27);
        let interval = self
            .previous
            .map(|previous| (pcr_delta(pcr, previous) / 27_000) as i64);

        self.previous = Some(pcr);
        self.rate.on_real_pcr(pcr);

        PcrMeasurement {
            jitter,
            accuracy,
            interval,
            arrival,
        }
    }
}

struct Monitor {
    tracker: Mutex<PcrTracker>,
    measurements: SharedList<PcrMeasurement>,
}

struct Ingest {
    config: Config,
    bytes: u64,
    last_sample: Option<Duration>,
}

impl Ingest {
    /// ビットレートの標本を取る時刻に達していれば標本を返す。
    fn sample_rate(&mut self, len: usize, arrival: Duration) -> Option<RateSample> {
        self.bytes += len as u64;
        let Some(last) = self.last_sample else {
            self.last_sample = Some(arrival);
            return None;
        };

        let elapsed = arrival.saturating_sub(last);
        if elapsed < self.config.rate_interval {
            return None;
        }
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms == 0 {
            return None;
        }

        let bitrate = self.bytes * 8 * 1000 / elapsed_ms;
        self.bytes = 0;
        self.last_sample = Some(arrival);
        Some(RateSample { bitrate, arrival })
    }
}

type JitterFactory = Box<dyn Fn() -> Box<dyn JitterModel> + Send + Sync>;

/// PCRとビットレートの計測器。
///
/// `Send + Sync`であり、`Arc`で共有して取り込み用のスレッドと読み出し用のスレッドから使う。
///
/// # サンプル
///
/// ```
/// use std::time::Duration;
/// use tsmon::pcr::PcrAnalyzer;
/// use tsmon::Pid;
///
/// let analyzer = PcrAnalyzer::new();
/// analyzer.add_pcr_pid(Pid::new(0x0100));
/// analyzer.process_buffer(&[], Duration::ZERO);
/// assert!(analyzer.lock_pcr_info(Pid::new(0x0100)).unwrap().is_empty());
/// ```
pub struct PcrAnalyzer {
    ingest: Mutex<Ingest>,
    monitors: RwLock<IndexMap<Pid, Monitor, FxBuildHasher>>,
    rates: SharedList<RateSample>,
    jitter_factory: JitterFactory,
}

impl PcrAnalyzer {
    /// 既定の設定で`PcrAnalyzer`を生成する。
    #[inline]
    pub fn new() -> PcrAnalyzer {
        PcrAnalyzer::with_config(Config::default())
    }

    /// `config`で`PcrAnalyzer`を生成する。ジッターは[`PcrOffsetJitter`]で計算する。
    #[inline]
    pub fn with_config(config: Config) -> PcrAnalyzer {
        PcrAnalyzer::with_jitter_model(config, || Box::new(PcrOffsetJitter::new()))
    }

    /// `config`で`PcrAnalyzer`を生成する。
    ///
    /// ジッターは、PIDを監視対象に追加するたびに`factory`で生成するモデルで計算する。
    pub fn with_jitter_model<F>(config: Config, factory: F) -> PcrAnalyzer
    where
        F: Fn() -> Box<dyn JitterModel> + Send + Sync + 'static,
    {
        let config = Config {
            packet_length: config.packet_length.max(PACKET_SIZE),
            rate_interval: config.rate_interval.max(Duration::from_millis(1)),
            capacity: config.capacity.max(1),
        };
        PcrAnalyzer {
            ingest: Mutex::new(Ingest {
                config,
                bytes: 0,
                last_sample: None,
            }),
            monitors: RwLock::new(IndexMap::default()),
            rates: Arc::new(Mutex::new(Vec::new())),
            jitter_factory: Box::new(factory),
        }
    }

    /// 現在の設定を返す。
    pub fn config(&self) -> Config {
        self.ingest.lock().config.clone()
    }

    /// 1パケットのバイト数を設定する。188未満の値は無視する。
    pub fn set_ts_packet_length(&self, packet_length: usize) {
        if packet_length < PACKET_SIZE {
            log::warn!("ts packet length {} is too short", packet_length);
            return;
        }
        self.ingest.lock().config.packet_length = packet_length;
    }

    /// ビットレートの標本を取る間隔を設定する。1ミリ秒未満の値は無視する。
    pub fn set_rate_interval(&self, interval: Duration) {
        if interval < Duration::from_millis(1) {
            log::warn!("rate interval {:?} is too short", interval);
            return;
        }
        self.ingest.lock().config.rate_interval = interval;
    }

    /// `pid`を監視対象に追加する。既に追加されていた場合は`false`を返す。
    pub fn add_pcr_pid(&self, pid: Pid) -> bool {
        let mut monitors = self.monitors.write();
        if monitors.contains_key(&pid) {
            return false;
        }

        log::debug!("monitor pcr of {:?}", pid);
        monitors.insert(
            pid,
            Monitor {
                tracker: Mutex::new(PcrTracker {
                    previous: None,
                    rate: RateModel::new(),
                    jitter: (self.jitter_factory)(),
                }),
                measurements: Arc::new(Mutex::new(Vec::new())),
            },
        );
        true
    }

    /// `pid`を監視対象から外す。監視していなかった場合は`false`を返す。
    pub fn remove_pcr_pid(&self, pid: Pid) -> bool {
        self.monitors.write().shift_remove(&pid).is_some()
    }

    /// 監視対象のPIDを追加した順に返す。
    pub fn pcr_pids(&self) -> Vec<Pid> {
        self.monitors.read().keys().copied().collect()
    }

    /// `arrival`に到着した`data`を処理する。
    ///
    /// `data`は設定したパケット長ごとに区切って処理する。
    /// 同期バイトが不正なパケットや、末尾のパケット長に満たない部分は読み飛ばす。
    pub fn process_buffer(&self, data: &[u8], arrival: Duration) {
        let mut ingest = self.ingest.lock();
        let capacity = ingest.config.capacity;
        let rate = ingest.sample_rate(data.len(), arrival);
        let pending = self.track(data, ingest.config.packet_length, arrival);
        drop(ingest);

        // 結果のリストへの追加は内部のロックをすべて解放してから行う
        if let Some(sample) = rate {
            log::trace!("bitrate {} bps", sample.bitrate);
            push_bounded(&self.rates, sample, capacity);
        }
        for (measurements, measurement) in pending {
            push_bounded(&measurements, measurement, capacity);
        }
    }

    fn track(
        &self,
        data: &[u8],
        packet_length: usize,
        arrival: Duration,
    ) -> Vec<(SharedList<PcrMeasurement>, PcrMeasurement)> {
        let mut pending = Vec::new();
        let monitors = self.monitors.read();
        if monitors.is_empty() {
            return pending;
        }

        let mut chunks = data.chunks_exact(packet_length);
        for chunk in &mut chunks {
            let Some(packet) = Packet::from_slice(chunk) else {
                continue;
            };
            if !packet.is_synced() {
                log::debug!("not a ts packet");
                continue;
            }

            let pid = packet.pid();
            let pcr = packet.pcr().map(|pcr| pcr.ticks());
            for (&monitored, monitor) in monitors.iter() {
                let mut tracker = monitor.tracker.lock();
                match pcr {
                    Some(pcr) if pid == monitored => {
                        let measurement = tracker.on_pcr(pcr, arrival);
                        pending.push((monitor.measurements.clone(), measurement));
                    }
                    _ => tracker.rate.on_payload_packet(),
                }
            }
        }

        if !chunks.remainder().is_empty() {
            log::debug!("skip {} trailing bytes", chunks.remainder().len());
        }
        pending
    }

    /// ビットレートの標本のリストを借用する。
    ///
    /// 返されたガードを解放するとリストは空になる。
    pub fn lock_rate(&self) -> Drain<RateSample> {
        Drain(self.rates.lock_arc())
    }

    /// `pid`の計測値のリストを借用する。
    ///
    /// 返されたガードを解放するとリストは空になる。`pid`を監視していない場合は`None`を返す。
    pub fn lock_pcr_info(&self, pid: Pid) -> Option<Drain<PcrMeasurement>> {
        let measurements = self.monitors.read().get(&pid)?.measurements.clone();
        Some(Drain(measurements.lock_arc()))
    }
}

impl Default for PcrAnalyzer {
    fn default() -> Self {
        PcrAnalyzer::new()
    }
}

impl fmt::Debug for PcrAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PcrAnalyzer")
            .field("config", &self.config())
            .field("pcr_pids", &self.pcr_pids())
            .finish_non_exhaustive()
    }
}
