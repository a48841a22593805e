//! # Gregor
//! Connection engine for the Apache Kafka wire protocol.
//!
//! This crate is the bottom layer of a Kafka client: one
//! [`Broker`](prelude::Broker) per endpoint, speaking the length-prefixed
//! binary protocol over a single TCP connection. Producer threads submit
//! already-encoded request bodies; the engine serializes them onto the
//! socket in submission order, reads the framed responses back in the same
//! order, matches each one to its request by correlation id, and resolves
//! a one-shot [`WaitHandle`](prelude::WaitHandle) per submission.
//!
//! What it deliberately does not do: interpret API payloads, discover
//! topic metadata, route to partition leaders, retry, or reconnect. Those
//! belong to the layers above; this one promises strict ordering and
//! correct response matching, nothing else.
//!
//! ## Getting started
//! ```no_run
//! use gregor::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<()> {
//! let broker = Broker::new(0, "localhost", 9092, "my-client");
//!
//! // The first waiter triggers the resolve/connect attempt. The call
//! // blocks, so keep it off the runtime threads.
//! tokio::task::spawn_blocking({
//!     let broker = broker.clone();
//!     move || broker.wait_for_connect(Duration::from_secs(1))
//! })
//! .await
//! .unwrap()?;
//!
//! // An ApiVersions request has an empty body at version 0.
//! let response = broker.call(api_key::API_VERSIONS, bytes::Bytes::new()).await?;
//! println!("{} response bytes", response.len());
//!
//! broker.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)

mod broker;
mod encode;
mod error;
mod frame;
mod parser;
mod protocol;

pub mod prelude {
    //! Main export of the engine's structures and methods.

    pub use crate::broker::{Broker, BrokerIdentity, WaitHandle};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{
        encode_request_frame, ResponseFrame, ResponseFrameDecoder, RESPONSE_HEADER_SIZE,
    };
    pub use crate::protocol::{
        api_key, parse_header_response, HeaderRequest, HeaderResponse, ResponseDecoder,
        API_VERSION,
    };

    pub use bytes;

    pub mod encode {
        pub use crate::encode::*;
    }

    pub mod parser {
        pub use crate::parser::*;
    }
}
