//! RESP1-style wire protocol: frame decoding/encoding and the internal reply
//! representation commands actually produce.

mod reply;
mod resp_frame;

pub use reply::Reply;
pub use resp_frame::{RespCodec, RespFrame};
