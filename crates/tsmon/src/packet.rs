//! MPEG2-TSのパケット。

use std::fmt;
use std::io::{self, Read};

use crate::pid::Pid;
use crate::time::Pcr;

/// 同期バイト。
pub const SYNC_BYTE: u8 = 0x47;
/// TSパケットの大きさ。
pub const PACKET_SIZE: usize = 188;

/// MPEG2-TSのパケット。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Packet(pub [u8; PACKET_SIZE]);

impl Packet {
    /// `data`の先頭188バイトを`Packet`として複製する。
    ///
    /// 長さが足りない場合は`None`を返す。同期バイトは確認しない。
    #[inline]
    pub fn from_slice(data: &[u8]) -> Option<Packet> {
        data.get(..PACKET_SIZE)
            .and_then(|data| data.try_into().ok())
            .map(Packet)
    }

    /// `r`からTSパケットを順次読み込むイテレーターを生成する。
    ///
    /// # サンプル
    ///
    /// ```
    /// # fn main() -> std::io::Result<()> {
    /// # let file = &mut (&[] as &[u8]);
    /// for packet in tsmon::Packet::iter(file) {
    ///     let packet = packet?;
    ///     assert_eq!(packet.sync_byte(), 0x47);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    #[inline]
    #[must_use]
    pub fn iter<R: Read>(r: R) -> PacketIter<R> {
        PacketIter { r }
    }

    /// `r`からTSパケットを1つ読み込む。
    ///
    /// 同期バイトが見つからない部分は読み飛ばし、同期バイトの位置から読み直す。
    /// 終端に達した場合は`None`を返す。
    pub fn read<R: Read>(r: R) -> io::Result<Option<Packet>> {
        fn read_inner<R: Read>(mut r: R) -> io::Result<Packet> {
            let mut packet = Packet([0; PACKET_SIZE]);
            r.read_exact(&mut packet.0)?;
            if packet.0[0] == SYNC_BYTE {
                return Ok(packet);
            }

            let mut skipped = 0;
            let pos = loop {
                if let Some(pos) = memchr::memchr(SYNC_BYTE, &packet.0) {
                    break pos;
                }

                skipped += PACKET_SIZE;
                r.read_exact(&mut packet.0)?;
            };
            log::debug!("resync after {} bytes", skipped + pos);

            packet.0.copy_within(pos.., 0);
            r.read_exact(&mut packet.0[PACKET_SIZE - pos..])?;
            Ok(packet)
        }

        match read_inner(r) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 同期バイトが正しいかどうかを返す。
    #[inline]
    pub fn is_synced(&self) -> bool {
        self.sync_byte() == SYNC_BYTE
    }

    /// 同期バイトを返す。
    #[inline]
    pub fn sync_byte(&self) -> u8 {
        self.0[0]
    }

    /// トランスポートエラーインジケーターを返す。
    #[inline]
    pub fn error_indicator(&self) -> bool {
        self.0[1] & 0b10000000 != 0
    }

    /// ペイロードユニット開始インジケーターを返す。
    #[inline]
    pub fn unit_start_indicator(&self) -> bool {
        self.0[1] & 0b01000000 != 0
    }

    /// PIDを返す。
    #[inline]
    pub fn pid(&self) -> Pid {
        Pid::read(&self.0[1..])
    }

    /// トランスポートスクランブル制御（2ビット）を返す。
    #[inline]
    pub fn scrambling_control(&self) -> u8 {
        (self.0[3] & 0b11000000) >> 6
    }

    /// アダプテーションフィールド制御（2ビット）を返す。
    #[inline]
    pub fn adaptation_field_control(&self) -> u8 {
        (self.0[3] & 0b00110000) >> 4
    }

    /// 連続性指標（4ビット）を返す。
    #[inline]
    pub fn continuity_counter(&self) -> u8 {
        self.0[3] & 0b00001111
    }

    /// パケットがアダプテーションフィールドを含むかどうかを返す。
    #[inline]
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control() & 0b10 != 0
    }

    /// アダプテーションフィールドがある場合、adaptation_field_lengthを返す。
    #[inline]
    pub fn adaptation_field_length(&self) -> Option<u8> {
        self.has_adaptation_field().then(|| self.0[4])
    }

    /// アダプテーションフィールドを返す。
    #[inline]
    pub fn adaptation_field(&self) -> Option<AdaptationField> {
        AdaptationField::new(self)
    }

    /// PCRがあれば返す。
    #[inline]
    pub fn pcr(&self) -> Option<Pcr> {
        self.adaptation_field().and_then(|af| af.pcr())
    }

    /// パケットがペイロードを含むかどうかを返す。
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control() & 0b01 != 0
    }

    /// ペイロードを返す。
    ///
    /// アダプテーションフィールド長がパケットを超える場合は`None`を返す。
    pub fn payload(&self) -> Option<&[u8]> {
        if !self.has_payload() {
            None
        } else if let Some(afl) = self.adaptation_field_length() {
            self.0.get(4 + 1 + afl as usize..)
        } else {
            self.0.get(4..)
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("sync_byte", &self.sync_byte())
            .field("error_indicator", &self.error_indicator())
            .field("unit_start_indicator", &self.unit_start_indicator())
            .field("pid", &self.pid())
            .field("adaptation_field_control", &self.adaptation_field_control())
            .field("continuity_counter", &self.continuity_counter())
            .finish_non_exhaustive()
    }
}

/// TSパケット内のアダプテーションフィールド。
#[derive(Debug)]
pub struct AdaptationField<'a>(&'a [u8]);

impl<'a> AdaptationField<'a> {
    #[inline]
    fn new(packet: &'a Packet) -> Option<AdaptationField<'a>> {
        packet
            .adaptation_field_length()
            .filter(|&length| length >= 1)
            .and_then(|length| packet.0.get(5..5 + length as usize))
            .map(AdaptationField)
    }

    /// 不連続性インジケーターを返す。
    #[inline]
    pub fn discontinuity_indicator(&self) -> bool {
        self.0[0] & 0b10000000 != 0
    }

    /// ランダムアクセスインジケーターを返す。
    #[inline]
    pub fn random_access_indicator(&self) -> bool {
        self.0[0] & 0b01000000 != 0
    }

    /// PCRフラグを返す。
    #[inline]
    pub fn pcr_flag(&self) -> bool {
        self.0[0] & 0b00010000 != 0
    }

    /// オリジナルPCRフラグを返す。
    #[inline]
    pub fn original_pcr_flag(&self) -> bool {
        self.0[0] & 0b00001000 != 0
    }

    /// PCRを返す。
    pub fn pcr(&self) -> Option<Pcr> {
        if !self.pcr_flag() {
            return None;
        }
        self.0
            .get(1..1 + 6)
            .and_then(|slice| slice.try_into().ok())
            .and_then(Pcr::read)
    }

    /// オリジナルPCRを返す。
    pub fn original_pcr(&self) -> Option<Pcr> {
        if !self.original_pcr_flag() {
            return None;
        }
        let offset = if self.pcr_flag() { 1 + 6 } else { 1 };
        self.0
            .get(offset..offset + 6)
            .and_then(|slice| slice.try_into().ok())
            .and_then(Pcr::read)
    }
}

/// [`Packet::iter`]から返される。TSパケットを順次読み込むイテレーター。
#[derive(Debug)]
pub struct PacketIter<R> {
    r: R,
}

impl<R: Read> Iterator for PacketIter<R> {
    type Item = io::Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        Packet::read(&mut self.r).transpose()
    }
}
