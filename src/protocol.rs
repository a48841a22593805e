//! Request & response headers of the bytecode protocol.
//!
//! Every request on the wire starts with the same header:
//! ```text
//! RequestHeader => api_key api_version correlation_id client_id
//!   api_key => INT16
//!   api_version => INT16
//!   correlation_id => INT32
//!   client_id => NULLABLE_STRING
//! ```
//! and every response echoes the correlation id back:
//! ```text
//! Response => length correlation_id body
//!   length => INT32
//!   correlation_id => INT32
//! ```
//! The engine owns these two headers and nothing else; API bodies travel
//! through it as opaque bytes in both directions.

use bytes::{BufMut, Bytes};
use nom::{combinator::map, number::complete::be_i32, sequence::tuple, IResult};
use nombytes::NomBytes;

use crate::{encode::ToByte, error::Result};

/// API version sent in all request headers.
///
/// Fixed per deployment; version 0 matches the 0.8.x wire dialect.
pub const API_VERSION: i16 = 0;

/// Kafka "API keys", i.e. RPC method ids.
///
/// Plain constants rather than an enum because they are encoded from and
/// compared against a raw `i16` everywhere they appear.
pub mod api_key {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const LIST_OFFSETS: i16 = 2;
    pub const METADATA: i16 = 3;
    pub const OFFSET_COMMIT: i16 = 8;
    pub const OFFSET_FETCH: i16 = 9;
    pub const FIND_COORDINATOR: i16 = 10;
    pub const API_VERSIONS: i16 = 18;
}

/// Preamble the engine prepends to every outbound request body.
///
/// `api_version` always carries [`API_VERSION`]; the correlation id is
/// assigned at enqueue time and is what the matching response will echo.
/// The body itself never appears here, it follows the header on the wire.
#[derive(Debug, Clone)]
pub struct HeaderRequest<'a> {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: &'a str,
}

impl<'a> HeaderRequest<'a> {
    pub fn new(api_key: i16, correlation_id: i32, client_id: &'a str) -> HeaderRequest<'a> {
        HeaderRequest {
            api_key,
            api_version: API_VERSION,
            correlation_id,
            client_id,
        }
    }
}

impl<'a> ToByte for HeaderRequest<'a> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        buffer.put_i16(self.api_key);
        buffer.put_i16(self.api_version);
        buffer.put_i32(self.correlation_id);
        self.client_id.encode(buffer)
    }
}

/// The staging region the reader pulls off the socket before each body:
/// the frame length, then the correlation id it will be matched by.
/// `length` counts everything after itself, correlation id included.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HeaderResponse {
    pub length: i32,
    pub correlation_id: i32,
}

pub fn parse_header_response(s: NomBytes) -> IResult<NomBytes, HeaderResponse> {
    map(tuple((be_i32, be_i32)), |(length, correlation_id)| {
        HeaderResponse {
            length,
            correlation_id,
        }
    })(s)
}

/// An already-framed response body, delivered through a
/// [`WaitHandle`](crate::prelude::WaitHandle).
///
/// Holds everything that followed the correlation id on the wire. The
/// engine does not interpret it; use the [`parser`](crate::prelude::parser)
/// combinators to take the payload apart into the response type for the
/// API that was called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDecoder {
    payload: Bytes,
}

impl ResponseDecoder {
    pub(crate) fn new(payload: Bytes) -> ResponseDecoder {
        ResponseDecoder { payload }
    }

    /// The raw response body, excluding the length prefix and correlation id.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
