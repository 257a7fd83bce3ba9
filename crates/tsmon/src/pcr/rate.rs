//! PCRの外挿に用いるレートモデル。

use crate::packet::PACKET_SIZE;
use crate::time::{pcr_delta, SYSTEM_CLOCK_FREQUENCY};

/// 直近2つのPCRの間に流れたパケット数から、次のPCRの値を外挿する。
///
/// レートは「パケット数×188×27MHz÷PCR差」で、単位は厳密なビットレートではない。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RateModel {
    baseline: Option<u64>,
    packets: u64,
    rate: u64,
}

impl RateModel {
    /// `RateModel`を生成する。
    #[inline]
    pub fn new() -> RateModel {
        RateModel::default()
    }

    /// 実際のPCRを受け取ったことを通知する。
    ///
    /// 初回は基準値を記録するだけで`false`を返す。
    /// 2回目以降はレートを計算し、レートが確定していれば`true`を返す。
    pub fn on_real_pcr(&mut self, pcr: u64) -> bool {
        let Some(baseline) = self.baseline.replace(pcr) else {
            return false;
        };

        let delta = pcr_delta(pcr, baseline);
        if delta == 0 {
            log::debug!("pcr did not advance: {}", pcr);
        } else {
            self.rate = scale(self.packets, delta);
        }
        self.packets = 1;

        self.rate != 0
    }

    /// PCRを含まないパケットを受け取ったことを通知する。
    ///
    /// 基準となるPCRを受け取るまでは数えない。
    #[inline]
    pub fn on_payload_packet(&mut self) {
        if self.baseline.is_some() {
            self.packets += 1;
        }
    }

    /// 現在のパケット数から外挿したPCRを27MHzクロック数で返す。
    ///
    /// レートが確定していない場合は`None`を返す。
    pub fn estimate(&self) -> Option<u64> {
        let baseline = self.baseline?;
        if self.rate == 0 {
            return None;
        }
        baseline.checked_add(scale(self.packets, self.rate))
    }

    /// 直近に計算したレートを返す。
    #[inline]
    pub fn rate(&self) -> Option<u64> {
        (self.rate != 0).then_some(self.rate)
    }
}

/// `packets * 188 * 27MHz / divisor`を128ビットで計算し、`u64`に収まらない場合は飽和させる。
fn scale(packets: u64, divisor: u64) -> u64 {
    let value =
        packets as u128 * PACKET_SIZE as u128 * SYSTEM_CLOCK_FREQUENCY as u128 / divisor as u128;
    u64::try_from(value).unwrap_or(u64::MAX)
}
