//! Error responses written back onto a stream.

use std::time::Duration;

use prost::Message;
use tokio::time::timeout;
use tracing::debug;

use crate::p2p::{encode_message, Encoding, RpcStream};

/// Response code for a successful response chunk.
pub const RESPONSE_CODE_SUCCESS: u8 = 0;
/// Response code for a request the peer should not have sent.
pub const RESPONSE_CODE_INVALID_REQUEST: u8 = 1;
/// Response code for a failure on our side.
pub const RESPONSE_CODE_SERVER_ERROR: u8 = 2;

/// Upper bound on a best-effort error write.
pub const ERROR_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Body of an error response.
#[derive(Clone, PartialEq, Message)]
pub struct ErrorMessage {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Encode an error response: the code byte followed by a framed [`ErrorMessage`].
pub fn create_error_response(code: u8, reason: &str, encoding: &dyn Encoding) -> Vec<u8> {
    let mut resp = vec![code];
    resp.extend(encode_message(
        encoding,
        &ErrorMessage {
            message: reason.to_string(),
        },
    ));
    resp
}

/// Write an error response onto `stream`.
///
/// Failures are logged and swallowed: the caller has already decided to
/// reject the request and the peer may well have gone away.
pub async fn write_error_response_to_stream<S>(
    code: u8,
    reason: &str,
    stream: &mut S,
    encoding: &dyn Encoding,
) where
    S: RpcStream + ?Sized,
{
    let resp = create_error_response(code, reason, encoding);
    match timeout(ERROR_RESPONSE_TIMEOUT, stream.write_all(&resp)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!(peer = %stream.remote_peer(), error = %e, "Could not write error response");
        }
        Err(_) => {
            debug!(peer = %stream.remote_peer(), "Timed out writing error response");
        }
    }
}
