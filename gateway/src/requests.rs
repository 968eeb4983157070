//! In-flight invocation records.
//!
//! Each request owns one record keyed by its request id. The handler task and the timeout timer
//! race to resolve it; whoever takes the reply slot first answers the client and every later
//! reply is dropped.

use dashmap::DashMap;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::response::GatewayResponse;

#[derive(Debug)]
struct InvocationRecord {
    /// `None` once the request has been answered.
    reply: Option<oneshot::Sender<GatewayResponse>>,
    timeout: Option<AbortHandle>,
}

#[derive(Debug, Default)]
pub struct RequestTable {
    records: DashMap<String, InvocationRecord>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its response will arrive on.
    pub fn begin(&self, id: &str) -> oneshot::Receiver<GatewayResponse> {
        let (tx, rx) = oneshot::channel();
        self.records.insert(
            id.to_string(),
            InvocationRecord {
                reply: Some(tx),
                timeout: None,
            },
        );
        rx
    }

    /// Remember the timer racing this request so resolving can cancel it.
    pub fn attach_timeout(&self, id: &str, timer: AbortHandle) {
        match self.records.get_mut(id) {
            Some(mut record) if record.reply.is_some() => record.timeout = Some(timer),
            // Already answered (or gone): the timer has nothing left to do.
            _ => timer.abort(),
        }
    }

    /// Answer `id`. Returns `false` when it was already answered or is unknown.
    pub fn resolve(&self, id: &str, response: GatewayResponse) -> bool {
        let (reply, timeout) = {
            let Some(mut record) = self.records.get_mut(id) else {
                return false;
            };
            let Some(reply) = record.reply.take() else {
                return false;
            };
            (reply, record.timeout.take())
        };
        if let Some(timer) = timeout {
            timer.abort();
        }
        // The receiver is gone when the client disconnected; the answer is still final.
        let _ = reply.send(response);
        true
    }

    /// Drop the record once the response has been written.
    pub fn finish(&self, id: &str) {
        if let Some((_, record)) = self.records.remove(id) {
            if let Some(timer) = record.timeout {
                timer.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Cancel every timer and forget every record.
    pub fn clear(&self) {
        for record in self.records.iter() {
            if let Some(timer) = &record.timeout {
                timer.abort();
            }
        }
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;

    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let table = RequestTable::new();
        let rx = table.begin("r1");

        assert!(table.resolve("r1", GatewayResponse::text(StatusCode::OK, "first")));
        assert!(!table.resolve("r1", GatewayResponse::text(StatusCode::OK, "second")));

        let resp = rx.await.unwrap();
        assert_eq!(resp.body, "first");

        table.finish("r1");
        assert!(table.is_empty());
        assert!(!table.resolve("r1", GatewayResponse::text(StatusCode::OK, "late")));
    }

    #[tokio::test]
    async fn resolving_cancels_the_timer() {
        let table = RequestTable::new();
        let _rx = table.begin("r1");
        let timer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        table.attach_timeout("r1", timer.abort_handle());

        table.resolve("r1", GatewayResponse::text(StatusCode::OK, "done"));
        let err = timer.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn attaching_to_an_answered_request_aborts_the_timer() {
        let table = RequestTable::new();
        let _rx = table.begin("r1");
        table.resolve("r1", GatewayResponse::text(StatusCode::OK, "done"));

        let timer = tokio::spawn(std::future::pending::<()>());
        table.attach_timeout("r1", timer.abort_handle());
        assert!(timer.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn clear_forgets_everything() {
        let table = RequestTable::new();
        let _a = table.begin("a");
        let _b = table.begin("b");
        assert_eq!(table.len(), 2);
        table.clear();
        assert!(table.is_empty());
    }
}
