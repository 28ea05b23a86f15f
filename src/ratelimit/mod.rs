//! Rate limiting of inbound streams.

mod collector;
mod limiter;
mod response;

pub use collector::Collector;
pub use limiter::{Limiter, DEFAULT_BURST_LIMIT, RPC_LIMITER_TOPIC};
pub use response::{
    create_error_response, write_error_response_to_stream, ErrorMessage,
    ERROR_RESPONSE_TIMEOUT, RESPONSE_CODE_INVALID_REQUEST, RESPONSE_CODE_SERVER_ERROR,
    RESPONSE_CODE_SUCCESS,
};
