// Binary wire format for the tick feed
// - Little-endian, packed, fixed size per message kind
// - #[repr(C)] with zerocopy byteorder types for portable cast to/from bytes
// - Every frame ends in a 4-byte XOR fold over the preceding bytes

use zerocopy::byteorder::{F64, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

type LE = zerocopy::byteorder::LittleEndian;

// Message kind identifiers (u16 on the wire)
pub mod kind {
    pub const TRADE: u16 = 1;
    pub const QUOTE: u16 = 2;
    pub const HEARTBEAT: u16 = 3;
}

pub const HEADER_SIZE: usize = 16;
pub const CHECKSUM_SIZE: usize = 4;
pub const TRADE_FRAME_SIZE: usize = 32;
pub const QUOTE_FRAME_SIZE: usize = 44;
pub const HEARTBEAT_FRAME_SIZE: usize = 20;
pub const MAX_FRAME_SIZE: usize = QUOTE_FRAME_SIZE;

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, AsBytes, Unaligned)]
pub struct EventHeader {
    pub kind: U16<LE>,
    pub sequence: U32<LE>,
    pub timestamp_ns: U64<LE>,
    pub symbol_id: U16<LE>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, AsBytes, Unaligned)]
pub struct TradePayload {
    pub price: F64<LE>,
    pub quantity: U32<LE>,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, AsBytes, Unaligned)]
pub struct QuotePayload {
    pub bid_price: F64<LE>,
    pub bid_quantity: U32<LE>,
    pub ask_price: F64<LE>,
    pub ask_quantity: U32<LE>,
}

/// Total frame length for a message kind, 0 for anything unknown.
#[inline]
pub fn frame_size(k: u16) -> usize {
    match k {
        kind::TRADE => TRADE_FRAME_SIZE,
        kind::QUOTE => QUOTE_FRAME_SIZE,
        kind::HEARTBEAT => HEARTBEAT_FRAME_SIZE,
        _ => 0,
    }
}

/// Bytewise XOR fold, zero-extended to 32 bits. Corruption detection only.
#[inline]
pub fn checksum(data: &[u8]) -> u32 {
    let mut acc = 0u8;
    for b in data {
        acc ^= b;
    }
    acc as u32
}

/// Recompute the fold over `frame[..len-4]` and compare with the trailing word.
#[inline]
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < CHECKSUM_SIZE {
        return false;
    }
    let body = frame.len() - CHECKSUM_SIZE;
    let mut word = [0u8; CHECKSUM_SIZE];
    word.copy_from_slice(&frame[body..]);
    checksum(&frame[..body]) == u32::from_le_bytes(word)
}

#[inline]
fn seal(out: &mut [u8], body: usize) -> usize {
    let word = checksum(&out[..body]).to_le_bytes();
    out[body..body + CHECKSUM_SIZE].copy_from_slice(&word);
    body + CHECKSUM_SIZE
}

/// Write a complete TRADE frame into `out`; returns the frame length.
pub fn encode_trade(header: &EventHeader, payload: &TradePayload, out: &mut [u8]) -> usize {
    debug_assert!(out.len() >= TRADE_FRAME_SIZE);
    out[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    out[HEADER_SIZE..HEADER_SIZE + 12].copy_from_slice(payload.as_bytes());
    seal(out, TRADE_FRAME_SIZE - CHECKSUM_SIZE)
}

/// Write a complete QUOTE frame into `out`; returns the frame length.
pub fn encode_quote(header: &EventHeader, payload: &QuotePayload, out: &mut [u8]) -> usize {
    debug_assert!(out.len() >= QUOTE_FRAME_SIZE);
    out[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    out[HEADER_SIZE..HEADER_SIZE + 24].copy_from_slice(payload.as_bytes());
    seal(out, QUOTE_FRAME_SIZE - CHECKSUM_SIZE)
}

/// Write a complete HEARTBEAT frame into `out`; returns the frame length.
pub fn encode_heartbeat(header: &EventHeader, out: &mut [u8]) -> usize {
    debug_assert!(out.len() >= HEARTBEAT_FRAME_SIZE);
    out[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    seal(out, HEARTBEAT_FRAME_SIZE - CHECKSUM_SIZE)
}

// Borrowed zero-copy views. Slices must be exactly the struct size.

#[inline]
pub fn header_view(bytes: &[u8]) -> Option<&EventHeader> {
    LayoutVerified::<&[u8], EventHeader>::new_unaligned(bytes).map(|lv| lv.into_ref())
}

#[inline]
pub fn trade_view(bytes: &[u8]) -> Option<&TradePayload> {
    LayoutVerified::<&[u8], TradePayload>::new_unaligned(bytes).map(|lv| lv.into_ref())
}

#[inline]
pub fn quote_view(bytes: &[u8]) -> Option<&QuotePayload> {
    LayoutVerified::<&[u8], QuotePayload>::new_unaligned(bytes).map(|lv| lv.into_ref())
}
