/// Wire format for request/response envelopes.
///
/// Requests are `{"method", "args", "kwargs"}` and responses are
/// `{"status_code", "status_text", "data"}`, both JSON text. The correlation
/// ID is carried as a message property, never in the body.
mod envelope;

pub use envelope::{
    //
    build_request,
    build_response,
    decode_request,
    decode_response,
    encode_request,
    encode_response,
    Kwargs,
    RpcRequest,
    RpcResponse,
    CONTENT_TYPE_JSON,
};
