use std::ops::RangeInclusive;

use crate::bits;
use crate::psi::{PsiSection, PsiTable, MAX_SECTION_SIZE};
use crate::utils::BytesExt;

use super::DescriptorBlock;

/// 各サービスに含まれるイベント。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EitEvent {
    /// イベント識別。
    pub event_id: u16,
    /// 開始時間（MJD16ビットとBCD24ビット）。
    pub start_time: u64,
    /// 継続時間（BCD24ビット）。
    pub duration: u32,
    /// 進行状態。
    pub running_status: u8,
    /// スクランブル。
    pub free_ca_mode: bool,
    /// 記述子の塊。
    pub descriptors: DescriptorBlock,
}

impl EitEvent {
    /// 継続時間を秒で返す。BCDとして不正な場合は`None`を返す。
    pub fn duration_secs(&self) -> Option<u32> {
        let bcd = |shift: u32| {
            let v = (self.duration >> shift) & 0xFF;
            let (hi, lo) = (v >> 4, v & 0x0F);
            (hi < 10 && lo < 10).then_some(hi * 10 + lo)
        };
        Some(bcd(16)? * 3600 + bcd(8)? * 60 + bcd(0)?)
    }

    fn encoded_len(&self) -> usize {
        10 + self.descriptors.encoded_len()
    }
}

/// EIT（Event Information Table）。
///
/// スケジュールのEITはセグメント単位で送出され、セグメント間のセクション番号は欠番となりうる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eit {
    /// テーブル識別。
    pub table_id: u8,
    /// サービス識別。
    pub service_id: u16,
    /// バージョン番号。
    pub version: u8,
    /// カレントネクスト指示。
    pub current_next: bool,
    /// トランスポートストリーム識別。
    pub transport_stream_id: u16,
    /// オリジナルネットワーク識別。
    pub original_network_id: u16,
    /// 最終テーブル識別。
    pub last_table_id: u8,
    /// イベントを格納する配列。
    pub events: Vec<EitEvent>,
}

impl Eit {
    /// 自TSにおけるイベント［現在／次］を格納するEITのテーブルID。
    pub const TABLE_ID_PF_ACTUAL: u8 = 0x4E;
    /// 他TSにおけるイベント［現在／次］を格納するEITのテーブルID。
    pub const TABLE_ID_PF_OTHER: u8 = 0x4F;
    /// 自TSにおけるイベント［スケジュール］を格納するEITのテーブルID。
    pub const TABLE_ID_SCHEDULE_ACTUAL: RangeInclusive<u8> = 0x50..=0x5F;
    /// 他TSにおけるイベント［スケジュール］を格納するEITのテーブルID。
    pub const TABLE_ID_SCHEDULE_OTHER: RangeInclusive<u8> = 0x60..=0x6F;

    // イベントに使えるセクション内のバイト数
    const EVENTS_PER_SECTION: usize = MAX_SECTION_SIZE - 3 - 5 - 4 - 6;

    /// `table_id`がEITのものかどうかを返す。
    #[inline]
    pub fn is_eit(table_id: u8) -> bool {
        (Self::TABLE_ID_PF_ACTUAL..=*Self::TABLE_ID_SCHEDULE_OTHER.end()).contains(&table_id)
    }

    fn read_events(mut data: &[u8], events: &mut Vec<EitEvent>) -> Option<()> {
        while !data.is_empty() {
            if data.len() < 12 {
                log::debug!("invalid EitEvent");
                return None;
            }

            let event_id = data[0..=1].read_be_16();
            let start_time = bits::get_bits_48(data, 2, 0, 40).ok()?;
            let duration = bits::get_bits(data, 7, 0, 24).ok()?;
            let running_status = (data[10] & 0b11100000) >> 5;
            let free_ca_mode = data[10] & 0b00010000 != 0;
            let Some((descriptors, rem)) = DescriptorBlock::read(&data[10..]) else {
                log::debug!("invalid EitEvent::descriptors");
                return None;
            };
            data = rem;

            events.push(EitEvent {
                event_id,
                start_time,
                duration,
                running_status,
                free_ca_mode,
                descriptors,
            });
        }
        Some(())
    }

    fn write_event(event: &EitEvent, out: &mut Vec<u8>) {
        let pos = out.len();
        out.extend_from_slice(&[0; 10]);
        let _ = bits::set_bits(out, pos, 0, 16, event.event_id as u32);
        let _ = bits::set_bits_48(out, pos + 2, 0, 40, event.start_time);
        let _ = bits::set_bits(out, pos + 7, 0, 24, event.duration);

        event.descriptors.write(out);
        // 記述子ループ長の上位4ビットに進行状態とスクランブルを書き込む
        let _ = bits::set_bits(out, pos + 10, 0, 3, event.running_status as u32);
        let _ = bits::set_bits(out, pos + 10, 3, 1, event.free_ca_mode as u32);
    }
}

impl PsiTable for Eit {
    fn read(sections: &[PsiSection]) -> Option<Eit> {
        let first = sections.first()?;
        if !Self::is_eit(first.table_id) {
            log::debug!("invalid Eit::table_id");
            return None;
        }
        if !first.syntax_indicator {
            log::debug!("invalid Eit::syntax");
            return None;
        }

        let data = first.payload();
        if data.len() < 6 {
            log::debug!("invalid Eit");
            return None;
        }
        let transport_stream_id = data[0..=1].read_be_16();
        let original_network_id = data[2..=3].read_be_16();
        let last_table_id = data[5];

        let mut events = Vec::new();
        for section in sections {
            let data = section.payload();
            if data.len() < 6 {
                log::debug!("invalid Eit");
                return None;
            }
            Self::read_events(&data[6..], &mut events)?;
        }

        Some(Eit {
            table_id: first.table_id,
            service_id: first.extension,
            version: first.version,
            current_next: first.current_next,
            transport_stream_id,
            original_network_id,
            last_table_id,
            events,
        })
    }

    fn write(&self) -> Vec<PsiSection> {
        let mut groups: Vec<&[EitEvent]> = Vec::new();
        let mut start = 0;
        let mut len = 0;
        for (i, event) in self.events.iter().enumerate() {
            if len + event.encoded_len() > Self::EVENTS_PER_SECTION && i > start {
                groups.push(&self.events[start..i]);
                start = i;
                len = 0;
            }
            len += event.encoded_len();
        }
        groups.push(&self.events[start..]);
        let last_number = (groups.len() - 1) as u8;

        groups
            .iter()
            .enumerate()
            .map(|(number, events)| {
                // セクションは番号順に詰めて送出する
                let segment_last = std::cmp::min(number as u8 | 0x07, last_number);

                let mut payload = Vec::with_capacity(6);
                payload.extend_from_slice(&self.transport_stream_id.to_be_bytes());
                payload.extend_from_slice(&self.original_network_id.to_be_bytes());
                payload.push(segment_last);
                payload.push(self.last_table_id);
                for event in events.iter() {
                    Self::write_event(event, &mut payload);
                }

                PsiSection::new_long(
                    self.table_id,
                    self.service_id,
                    self.version,
                    self.current_next,
                    number as u8,
                    last_number,
                    &payload,
                )
            })
            .collect()
    }

    fn segment_last_section_number(section: &PsiSection) -> Option<u8> {
        if !Self::is_eit(section.table_id) {
            return None;
        }
        section.payload().get(4).copied()
    }
}
