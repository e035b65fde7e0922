//! Wire codec and data model for the cluster RPC protocol.

pub mod address;
pub mod codec;
pub mod error;
pub mod frame;
pub mod logging;
pub mod packet;
pub mod substring;

pub use address::Address;
pub use codec::{is_null, marshal, unmarshal, CodecName, CodecRegistry, JsonCodec, MsgPackCodec, TextCodec, TextValue};
pub use error::{ClusterError, ClusterResult};
pub use frame::{decode_req, decode_resp, encode_req, encode_resp, read_frame, recoverable_session, ReqReassembly, RespReassembly, PART_SIZE};
pub use packet::{ReqPack, RespPack};
