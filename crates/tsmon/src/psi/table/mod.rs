//! [`PsiTable`](super::PsiTable)を実装するテーブルの定義。

mod eit;
mod pat;
mod pmt;

pub use eit::*;
pub use pat::*;
pub use pmt::*;

use crate::bits;
use crate::utils::BytesExt;

/// 記述子。内容はパースせずに保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// 記述子タグ。
    pub tag: u8,
    /// 記述子の内容。
    pub data: Vec<u8>,
}

/// 先頭に12ビットの長さを持つ記述子の塊。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DescriptorBlock(pub Vec<Descriptor>);

impl DescriptorBlock {
    /// `data`から記述子群を読み取り後続データと共に返す。
    ///
    /// データ長が不足している場合は`None`を返す。
    pub fn read(data: &[u8]) -> Option<(DescriptorBlock, &[u8])> {
        if data.len() < 2 {
            return None;
        }

        let length = (data[0..=1].read_be_16() & 0x0FFF) as usize;
        let data = &data[2..];
        if data.len() < length {
            return None;
        }
        let (mut block, rem) = data.split_at(length);

        let mut descriptors = Vec::new();
        while !block.is_empty() {
            if block.len() < 2 || block.len() < 2 + block[1] as usize {
                return None;
            }
            let (desc, next) = block.split_at(2 + block[1] as usize);
            descriptors.push(Descriptor {
                tag: desc[0],
                data: desc[2..].to_vec(),
            });
            block = next;
        }

        Some((DescriptorBlock(descriptors), rem))
    }

    /// 長さを含めた、書き込みに必要なバイト数を返す。
    pub fn encoded_len(&self) -> usize {
        2 + self.0.iter().map(|d| 2 + d.data.len()).sum::<usize>()
    }

    /// 予約ビットを1とした長さに続けて記述子群を`out`に書き込む。
    pub fn write(&self, out: &mut Vec<u8>) {
        let pos = out.len();
        out.extend_from_slice(&[0, 0]);
        // 2バイト確保済み
        let _ = bits::set_bits(out, pos, 0, 4, 0b1111);
        let _ = bits::set_bits(out, pos, 4, 12, (self.encoded_len() - 2) as u32);
        for desc in &self.0 {
            out.push(desc.tag);
            out.push(desc.data.len() as u8);
            out.extend_from_slice(&desc.data);
        }
    }
}
