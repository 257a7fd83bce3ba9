//! MPEG2-TSのPSI/SIとPCRを監視するためのクレート。
//!
//! TSパケットからPSI/SIのセクションを再構成してテーブルを復号する[`psi`]と、
//! PCRのジッター・精度・間隔およびビットレートを計測する[`pcr`]からなる。

#![deny(missing_docs)]

pub mod bits;
pub mod crc32;
pub mod packet;
pub mod pcr;
pub mod pid;
pub mod psi;
pub mod time;
mod utils;

pub use packet::Packet;
pub use pid::Pid;
