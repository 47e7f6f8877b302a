//! gRPC client for the relay's admin API (spec.md §4.6, §6):
//! `HandlerService.AlterInbound` for hot add/remove, `StatsService.QueryStats`
//! for presence. Rather than generate code from the relay's own `.proto`
//! sources via `tonic-build`/`protoc`, the wire messages are hand-written
//! `prost::Message` structs mirroring xray-core's stable, narrow services —
//! the only two this crate ever calls.
//!
//! The channel is always dialed over an existing SSH `direct-tcpip` stream
//! reaching `127.0.0.1:10085` on the relay (spec.md §6), never a direct TCP
//! connection — [`connect_over`] takes that stream instead of an address.

use prost::Message as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};

use crate::error::{Result, TwError};

pub const ADMIN_API_ENDPOINT: &str = "http://127.0.0.1:10085";

const HANDLER_SERVICE_PATH: &str = "/v2ray.core.app.proxyman.command.HandlerService/AlterInbound";
const STATS_SERVICE_PATH: &str = "/v2ray.core.app.stats.command.StatsService/QueryStats";

/// xray-core's own envelope for a polymorphic operation payload, used
/// instead of `google.protobuf.Any`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserMessage {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<UserMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AlterInboundResponse {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsRequest {
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}

/// Wraps an already-open duplex stream (an SSH channel) as the transport
/// for one gRPC `Channel`, instead of letting tonic dial TCP itself.
pub async fn connect_over<S>(stream: S) -> Result<Channel>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut stream = Some(stream);
    Endpoint::try_from(ADMIN_API_ENDPOINT)
        .map_err(|e| TwError::relay(format!("invalid admin endpoint: {e}")))?
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let stream = stream.take();
            async move {
                stream.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "admin channel stream already consumed",
                    )
                })
            }
        }))
        .await
        .map_err(|e| TwError::relay(format!("admin API connect failed: {e}")))
}

pub async fn add_user(channel: Channel, inbound_tag: &str, email: &str) -> Result<()> {
    let operation = AddUserOperation {
        user: Some(UserMessage {
            level: 0,
            email: email.to_string(),
        }),
    };
    let request = AlterInboundRequest {
        tag: inbound_tag.to_string(),
        operation: Some(TypedMessage {
            r#type: "v2ray.core.app.proxyman.command.AddUserOperation".to_string(),
            value: prost::Message::encode_to_vec(&operation),
        }),
    };
    let _: AlterInboundResponse = call(channel, HANDLER_SERVICE_PATH, request).await?;
    Ok(())
}

pub async fn remove_user(channel: Channel, inbound_tag: &str, email: &str) -> Result<()> {
    let operation = RemoveUserOperation {
        email: email.to_string(),
    };
    let request = AlterInboundRequest {
        tag: inbound_tag.to_string(),
        operation: Some(TypedMessage {
            r#type: "v2ray.core.app.proxyman.command.RemoveUserOperation".to_string(),
            value: prost::Message::encode_to_vec(&operation),
        }),
    };
    let _: AlterInboundResponse = call(channel, HANDLER_SERVICE_PATH, request).await?;
    Ok(())
}

pub async fn query_stats(channel: Channel, pattern: &str, reset: bool) -> Result<Vec<Stat>> {
    let request = QueryStatsRequest {
        pattern: pattern.to_string(),
        reset,
    };
    let response: QueryStatsResponse = call(channel, STATS_SERVICE_PATH, request).await?;
    Ok(response.stat)
}

async fn call<Req, Resp>(channel: Channel, path: &'static str, request: Req) -> Result<Resp>
where
    Req: prost::Message + Default + 'static,
    Resp: prost::Message + Default + 'static,
{
    let mut client = tonic::client::Grpc::new(channel);
    client
        .ready()
        .await
        .map_err(|e| TwError::relay(format!("admin API not ready: {e}")))?;
    let codec: ProstCodec<Req, Resp> = ProstCodec::default();
    let path = PathAndQuery::from_static(path);
    let response = client
        .unary(tonic::Request::new(request), path, codec)
        .await
        .map_err(|e| TwError::relay(format!("admin API call failed: {e}")))?;
    Ok(response.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_user_operation_round_trips_through_the_typed_message_envelope() {
        let op = AddUserOperation {
            user: Some(UserMessage {
                level: 0,
                email: "alice".into(),
            }),
        };
        let bytes = prost::Message::encode_to_vec(&op);
        let decoded = AddUserOperation::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.user.unwrap().email, "alice");
    }

    #[test]
    fn query_stats_request_encodes_pattern_and_reset() {
        let req = QueryStatsRequest {
            pattern: "user>>>".into(),
            reset: true,
        };
        let bytes = prost::Message::encode_to_vec(&req);
        let decoded = QueryStatsRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.pattern, "user>>>");
        assert!(decoded.reset);
    }
}
