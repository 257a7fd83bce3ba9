//! PCRジッターの計算。

use std::time::Duration;

use crate::time::{pcr_delta, SYSTEM_CLOCK_FREQUENCY};

/// PCRとその到着時刻からジッターを計算するもの。
///
/// [`PcrAnalyzer`](super::PcrAnalyzer)は監視するPIDごとに1つのインスタンスを使う。
pub trait JitterModel: Send {
    /// PCR（27MHzクロック数）とその到着時刻を受け取り、ジッターをナノ秒で返す。
    fn recv_pcr(&mut self, pcr: u64, arrival: Duration) -> i64;
}

#[derive(Debug, Clone, Copy)]
struct Origin {
    last_pcr: u64,
    arrival: Duration,
}

/// 最初のPCRからの経過時間と到着時刻の差（オフセット）を求め、
/// その指数移動平均からのずれをジッターとする既定のモデル。
///
/// 移動平均はクロックのドリフトを吸収するためのもので、重みは1/16。
#[derive(Debug, Default, Clone)]
pub struct PcrOffsetJitter {
    origin: Option<Origin>,
    elapsed_ticks: u64,
    drift: i64,
}

impl PcrOffsetJitter {
    const DRIFT_WEIGHT: i64 = 16;

    /// `PcrOffsetJitter`を生成する。
    #[inline]
    pub fn new() -> PcrOffsetJitter {
        PcrOffsetJitter::default()
    }
}

impl JitterModel for PcrOffsetJitter {
    fn recv_pcr(&mut self, pcr: u64, arrival: Duration) -> i64 {
        let Some(origin) = self.origin.as_mut() else {
            self.origin = Some(Origin {
                last_pcr: pcr,
                arrival,
            });
            return 0;
        };

        self.elapsed_ticks += pcr_delta(pcr, origin.last_pcr);
        origin.last_pcr = pcr;

        let pcr_ns = (self.elapsed_ticks as i128 * 1_000_000_000
            / SYSTEM_CLOCK_FREQUENCY as i128) as i64;
        let arrival_ns = arrival.saturating_sub(origin.arrival).as_nanos() as i64;
        let offset = arrival_ns - pcr_ns;

        let jitter = offset - self.drift;
        self.drift += jitter / Self::DRIFT_WEIGHT;
        jitter
    }
}
