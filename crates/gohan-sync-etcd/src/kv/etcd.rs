use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, instrument};

use super::proto;
use super::{
    prefix_range_end, Compare, KeyValue, KvError, KvEvent, KvEventKind, KvStore, KvWatchStream,
    LeaseId, RangeOptions, RangeResult, SortTarget, TxnOp, TxnResult,
};

const WATCH_BUFFER: usize = 64;

/// etcd v3 client speaking the gRPC API directly.
///
/// The channel connects lazily and balances requests across every configured
/// endpoint. Unary calls are bounded by the request timeout; watches and lease
/// refreshes run on their own bidirectional streams.
pub struct EtcdKvStore {
    channel: Channel,
    timeout: Duration,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl EtcdKvStore {
    /// Create a client for `endpoints` (`host:port` or full URLs).
    pub fn connect(endpoints: &[String], timeout: Duration) -> Result<Self, KvError> {
        if endpoints.is_empty() {
            return Err(KvError::Unavailable("no etcd endpoints configured".to_string()));
        }

        let mut resolved = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let url = if endpoint.contains("://") {
                endpoint.clone()
            } else {
                format!("http://{}", endpoint)
            };
            let endpoint = Endpoint::from_shared(url.clone())
                .map_err(|e| KvError::Unavailable(format!("invalid etcd endpoint {}: {}", url, e)))?
                .connect_timeout(timeout)
                .tcp_nodelay(true);
            resolved.push(endpoint);
        }

        debug!("etcd client configured for {} endpoint(s)", resolved.len());

        Ok(Self {
            channel: Channel::balance_list(resolved.into_iter()),
            timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<(), KvError> {
        if self.closed.load(Ordering::Acquire) {
            Err(KvError::Closed)
        } else {
            Ok(())
        }
    }

    async fn client(&self) -> Result<Grpc<Channel>, KvError> {
        self.ensure_open()?;
        let mut client = Grpc::new(self.channel.clone());
        client
            .ready()
            .await
            .map_err(|e| KvError::Unavailable(format!("etcd channel not ready: {}", e)))?;
        Ok(client)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, KvError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let call = async {
            let mut client = self.client().await?;
            let codec: ProstCodec<Req, Resp> = ProstCodec::default();
            client
                .unary(Request::new(request), PathAndQuery::from_static(path), codec)
                .await
                .map(|response| response.into_inner())
                .map_err(status_error)
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    fn name(&self) -> &'static str {
        "etcdv3"
    }

    #[instrument(skip(self), level = "debug")]
    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResult, KvError> {
        let mut request = proto::RangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        };
        if options.prefix {
            request.range_end = prefix_range_end(key.as_bytes());
        }
        if options.sort == SortTarget::ModRevision {
            request.sort_order = proto::range_request::SortOrder::Ascend as i32;
            request.sort_target = proto::range_request::SortTarget::Mod as i32;
        }

        let response: proto::RangeResponse = self.unary(proto::KV_RANGE, request).await?;
        Ok(RangeResult {
            revision: header_revision(&response.header),
            kvs: response.kvs.into_iter().map(KeyValue::from).collect(),
        })
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64, KvError> {
        let request = proto::PutRequest {
            key: key.as_bytes().to_vec(),
            value,
            lease: lease.unwrap_or(0),
            prev_kv: false,
        };
        let response: proto::PutResponse = self.unary(proto::KV_PUT, request).await?;
        Ok(header_revision(&response.header))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str, prefix: bool) -> Result<i64, KvError> {
        let request = proto::DeleteRangeRequest {
            key: key.as_bytes().to_vec(),
            range_end: if prefix {
                prefix_range_end(key.as_bytes())
            } else {
                Vec::new()
            },
            prev_kv: false,
        };
        let response: proto::DeleteRangeResponse = self.unary(proto::KV_DELETE_RANGE, request).await?;
        Ok(response.deleted)
    }

    #[instrument(skip_all, level = "debug", fields(compares = compares.len()))]
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResult, KvError> {
        let request = proto::TxnRequest {
            compare: compares.into_iter().map(proto::Compare::from).collect(),
            success: success.into_iter().map(proto::RequestOp::from).collect(),
            failure: failure.into_iter().map(proto::RequestOp::from).collect(),
        };
        let response: proto::TxnResponse = self.unary(proto::KV_TXN, request).await?;
        Ok(TxnResult {
            succeeded: response.succeeded,
            revision: header_revision(&response.header),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, KvError> {
        let request = proto::LeaseGrantRequest {
            ttl: ttl.as_secs().max(1) as i64,
            id: 0,
        };
        let response: proto::LeaseGrantResponse = self.unary(proto::LEASE_GRANT, request).await?;
        if !response.error.is_empty() {
            return Err(KvError::Protocol(response.error));
        }
        Ok(response.id)
    }

    #[instrument(skip(self), level = "debug")]
    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<i64, KvError> {
        let call = async {
            let mut client = self.client().await?;
            let (tx, rx) = mpsc::channel(1);
            tx.send(proto::LeaseKeepAliveRequest { id: lease })
                .await
                .map_err(|_| KvError::Protocol("keep-alive request stream closed".to_string()))?;

            let codec: ProstCodec<proto::LeaseKeepAliveRequest, proto::LeaseKeepAliveResponse> =
                ProstCodec::default();
            let mut responses = client
                .streaming(
                    Request::new(ReceiverStream::new(rx)),
                    PathAndQuery::from_static(proto::LEASE_KEEP_ALIVE),
                    codec,
                )
                .await
                .map_err(status_error)?
                .into_inner();

            match responses.message().await.map_err(status_error)? {
                Some(response) => Ok(response.ttl.max(0)),
                None => Err(KvError::Protocol("keep-alive stream ended without a response".to_string())),
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(KvError::Timeout(self.timeout)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        let request = proto::LeaseRevokeRequest { id: lease };
        let result: Result<proto::LeaseRevokeResponse, KvError> =
            self.unary(proto::LEASE_REVOKE, request).await;
        match result {
            Ok(_) => Ok(()),
            Err(KvError::Protocol(message)) if message.contains("lease not found") => {
                Err(KvError::LeaseNotFound(lease))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn watch(
        &self,
        key: &str,
        prefix: bool,
        start_revision: i64,
        cancel: CancellationToken,
    ) -> Result<KvWatchStream, KvError> {
        let (request_tx, request_rx) = mpsc::channel(1);
        let create = proto::WatchRequest {
            request_union: Some(proto::watch_request::RequestUnion::CreateRequest(
                proto::WatchCreateRequest {
                    key: key.as_bytes().to_vec(),
                    range_end: if prefix {
                        prefix_range_end(key.as_bytes())
                    } else {
                        Vec::new()
                    },
                    start_revision: start_revision.max(0),
                    ..Default::default()
                },
            )),
        };
        request_tx
            .send(create)
            .await
            .map_err(|_| KvError::Protocol("watch request stream closed".to_string()))?;

        let mut client = self.client().await?;
        let codec: ProstCodec<proto::WatchRequest, proto::WatchResponse> = ProstCodec::default();
        let mut inbound = client
            .streaming(
                Request::new(ReceiverStream::new(request_rx)),
                PathAndQuery::from_static(proto::WATCH),
                codec,
            )
            .await
            .map_err(status_error)?
            .into_inner();

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let shutdown = self.shutdown.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            // Dropping the request sender half-closes the stream and ends the watch.
            let _requests = request_tx;
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => {
                        let _ = tx.send(Err(KvError::Closed)).await;
                        break;
                    }
                    message = inbound.message() => message,
                };

                let failure = match message {
                    Ok(Some(response)) => {
                        if response.compact_revision > 0 {
                            Some(KvError::Compacted(response.compact_revision))
                        } else if response.canceled {
                            Some(KvError::WatchCanceled(response.cancel_reason))
                        } else if response.events.is_empty() {
                            continue;
                        } else {
                            let events: Vec<KvEvent> =
                                response.events.into_iter().filter_map(convert_event).collect();
                            if tx.send(Ok(events)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    }
                    Ok(None) => Some(KvError::Unavailable("watch stream closed by server".to_string())),
                    Err(status) => Some(status_error(status)),
                };

                if let Some(err) = failure {
                    debug!("etcd watch on {} ended: {}", key, err);
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
            debug!("etcd watch on {} stopped", key);
        });

        Ok(rx)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            debug!("etcd client closed");
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

fn status_error(status: Status) -> KvError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
            KvError::Unavailable(status.message().to_string())
        }
        _ => KvError::Protocol(status.message().to_string()),
    }
}

fn header_revision(header: &Option<proto::ResponseHeader>) -> i64 {
    header.as_ref().map(|h| h.revision).unwrap_or(0)
}

fn convert_event(event: proto::Event) -> Option<KvEvent> {
    let kind = match proto::event::EventType::try_from(event.r#type) {
        Ok(proto::event::EventType::Put) => KvEventKind::Put,
        Ok(proto::event::EventType::Delete) => KvEventKind::Delete,
        Err(_) => return None,
    };
    event.kv.map(|kv| KvEvent {
        kind,
        kv: KeyValue::from(kv),
    })
}

impl From<proto::KeyValue> for KeyValue {
    fn from(kv: proto::KeyValue) -> Self {
        Self {
            key: String::from_utf8_lossy(&kv.key).into_owned(),
            value: kv.value,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            version: kv.version,
            lease: kv.lease,
        }
    }
}

impl From<Compare> for proto::Compare {
    fn from(compare: Compare) -> Self {
        use proto::compare::{CompareResult, CompareTarget, TargetUnion};

        let (key, target, union) = match compare {
            Compare::CreateRevision { key, revision } => {
                (key, CompareTarget::Create, TargetUnion::CreateRevision(revision))
            }
            Compare::ModRevision { key, revision } => {
                (key, CompareTarget::Mod, TargetUnion::ModRevision(revision))
            }
            Compare::Value { key, value } => (key, CompareTarget::Value, TargetUnion::Value(value)),
        };

        Self {
            result: CompareResult::Equal as i32,
            target: target as i32,
            key: key.into_bytes(),
            target_union: Some(union),
            range_end: Vec::new(),
        }
    }
}

impl From<TxnOp> for proto::RequestOp {
    fn from(op: TxnOp) -> Self {
        use proto::request_op::Request;

        let request = match op {
            TxnOp::Put { key, value, lease } => Request::RequestPut(proto::PutRequest {
                key: key.into_bytes(),
                value,
                lease: lease.unwrap_or(0),
                prev_kv: false,
            }),
            TxnOp::Delete { key } => Request::RequestDeleteRange(proto::DeleteRangeRequest {
                key: key.into_bytes(),
                range_end: Vec::new(),
                prev_kv: false,
            }),
        };
        Self {
            request: Some(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_conversion() {
        let compare = proto::Compare::from(Compare::CreateRevision {
            key: "/lock".to_string(),
            revision: 0,
        });
        assert_eq!(compare.key, b"/lock".to_vec());
        assert_eq!(compare.target, proto::compare::CompareTarget::Create as i32);
        assert_eq!(compare.result, proto::compare::CompareResult::Equal as i32);
        assert_eq!(
            compare.target_union,
            Some(proto::compare::TargetUnion::CreateRevision(0))
        );
    }

    #[test]
    fn test_txn_op_conversion() {
        let op = proto::RequestOp::from(TxnOp::Put {
            key: "/k".to_string(),
            value: b"v".to_vec(),
            lease: Some(42),
        });
        match op.request {
            Some(proto::request_op::Request::RequestPut(put)) => {
                assert_eq!(put.key, b"/k".to_vec());
                assert_eq!(put.lease, 42);
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_convert_event() {
        let event = proto::Event {
            r#type: proto::event::EventType::Delete as i32,
            kv: Some(proto::KeyValue {
                key: b"/a".to_vec(),
                mod_revision: 9,
                ..Default::default()
            }),
            prev_kv: None,
        };
        let converted = convert_event(event).unwrap();
        assert_eq!(converted.kind, KvEventKind::Delete);
        assert_eq!(converted.kv.key, "/a");
        assert_eq!(converted.kv.mod_revision, 9);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(Status::unavailable("down")),
            KvError::Unavailable(_)
        ));
        assert!(matches!(
            status_error(Status::not_found("etcdserver: requested lease not found")),
            KvError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let err = EtcdKvStore::connect(&[], Duration::from_secs(1)).err();
        assert!(matches!(err, Some(KvError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let store = EtcdKvStore::connect(&["127.0.0.1:1".to_string()], Duration::from_millis(200)).unwrap();
        store.close().await;
        assert_eq!(
            store.range("/a", RangeOptions::exact()).await.unwrap_err(),
            KvError::Closed
        );
    }
}
