//! Tests for the reconciler module
//!
//! These run whole passes against an in-memory telemetry store and route
//! table and check:
//! - publish ordering within a pass
//! - stale endpoint cleanup across passes
//! - degraded and unreadable route tables
//! - service removal and the request queue

#[cfg(test)]
mod tests {
    use super::super::reachability::{BackendAddress, ServicePass};
    use super::super::reconciler::*;
    use crate::device::{
        RouteTableReader, RouteTableSource, TelemetryClient, TelemetryResponse, TelemetryStore,
    };
    use crate::error::{Error, Result};
    use crate::model::{ServiceIdentity, ServiceOperState, ServiceReason};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    const ROOT: &str = ".kbutler";

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        Publish(String, Value),
        Delete(String),
    }

    #[derive(Default)]
    struct FakeStore {
        calls: Mutex<Vec<Call>>,
        reject_publishes: bool,
    }

    impl FakeStore {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Delete(path) => Some(path),
                    _ => None,
                })
                .collect()
        }

        fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl TelemetryStore for FakeStore {
        async fn add_or_update(&self, path: &str, json: &str) -> Result<TelemetryResponse> {
            let value: Value = serde_json::from_str(json).unwrap();
            self.calls
                .lock()
                .unwrap()
                .push(Call::Publish(path.to_string(), value));
            if self.reject_publishes {
                return Err(Error::DeviceRpc("unavailable".to_string()));
            }
            Ok(TelemetryResponse::success())
        }

        async fn delete(&self, path: &str) -> Result<TelemetryResponse> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Delete(path.to_string()));
            Ok(TelemetryResponse::success())
        }
    }

    /// Route table whose contents tests can swap between passes
    #[derive(Default)]
    struct FakeRoutes {
        table: Mutex<Option<Value>>,
        reads: Mutex<usize>,
    }

    impl FakeRoutes {
        fn set(&self, table: Option<Value>) {
            *self.table.lock().unwrap() = table;
        }
    }

    #[async_trait]
    impl RouteTableSource for FakeRoutes {
        async fn get_route_table(&self, network_instance: &str) -> Result<Value> {
            assert_eq!(network_instance, "default");
            *self.reads.lock().unwrap() += 1;
            self.table
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::DeviceRpc("route table unavailable".to_string()))
        }
    }

    /// `10.0.0.5/32` via next hops 10.1.2.3 and 10.1.2.4
    fn table(status: &str) -> Value {
        json!({
            "ipv4-unicast": {"route": [{
                "ipv4-prefix": "10.0.0.5/32",
                "next-hop-group": 7,
                "fib-programming": {"status": status}
            }]},
            "next-hop-group": [{"index": 7, "next-hop": [{"next-hop": 1}, {"next-hop": 2}]}],
            "next-hop": [
                {"index": 1, "ip-address": "10.1.2.3"},
                {"index": 2, "ip-address": "10.1.2.4"}
            ]
        })
    }

    fn web() -> ServiceIdentity {
        ServiceIdentity::new("web", "default")
    }

    fn backend(node: &str, addr: &str) -> BackendAddress {
        BackendAddress {
            ip: "192.168.0.10".to_string(),
            node_name: Some(node.to_string()),
            node_address: Some(addr.to_string()),
        }
    }

    fn pass(backends: Vec<BackendAddress>) -> ServicePass {
        ServicePass {
            service: web(),
            external_address: Some("10.0.0.5".to_string()),
            backends,
        }
    }

    fn service_path() -> String {
        format!(r#"{}.service{{.service_name=="web"&&.namespace=="default"}}"#, ROOT)
    }

    fn endpoint_path(host: &str) -> String {
        format!(
            r#"{}.external_address{{.address=="10.0.0.5"&&.hostname=="{}"}}"#,
            service_path(),
            host
        )
    }

    fn setup(store: FakeStore) -> (Arc<FakeStore>, Arc<FakeRoutes>, ReconcileEngine) {
        let store = Arc::new(store);
        let routes = Arc::new(FakeRoutes::default());
        let engine = ReconcileEngine::new(
            ROOT,
            TelemetryClient::new(store.clone()),
            RouteTableReader::new(routes.clone(), "default"),
        );
        (store, routes, engine)
    }

    fn completed(report: PassReport) -> (crate::model::ServiceState, usize, usize) {
        match report {
            PassReport::Completed {
                service,
                published_endpoints,
                gc,
            } => (service, published_endpoints, gc.deleted.len()),
            PassReport::Skipped => panic!("pass was skipped"),
        }
    }

    #[tokio::test]
    async fn test_healthy_service_publishes_endpoints_before_service() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));

        let report = engine
            .reconcile_service(pass(vec![
                backend("node-a", "10.1.2.3"),
                backend("node-b", "10.1.2.4"),
            ]))
            .await
            .unwrap();

        let (service, published, deleted) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Up);
        assert_eq!(published, 2);
        assert_eq!(deleted, 0);

        let calls = store.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], Call::Publish(p, _) if *p == endpoint_path("node-a")));
        assert!(matches!(&calls[1], Call::Publish(p, _) if *p == endpoint_path("node-b")));
        match &calls[2] {
            Call::Publish(p, v) => {
                assert_eq!(*p, service_path());
                assert_eq!(
                    *v,
                    json!({"oper_state": {"value": "up"}, "oper_reason": {"value": ""}})
                );
            }
            other => panic!("unexpected call {:?}", other),
        }
        // one snapshot per pass
        assert_eq!(*routes.reads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_degraded_then_shrunk_service_deletes_stale_endpoint() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));

        // node-c's address is not a next hop of the external route
        let report = engine
            .reconcile_service(pass(vec![
                backend("node-a", "10.1.2.3"),
                backend("node-c", "10.9.9.9"),
            ]))
            .await
            .unwrap();
        let (service, _, _) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Degraded);
        assert_eq!(service.reason(), Some(ServiceReason::EndpointNexthopMissing));

        let node_c = store
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Publish(p, v) if p == endpoint_path("node-c") => Some(v),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            node_c,
            json!({
                "oper_state": {"value": "down"},
                "oper_reason": {"value": "no-route-to-host"},
                "fib_programmed": {"value": false},
                "host_address": {"value": "10.9.9.9"}
            })
        );

        store.clear();
        let report = engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        let (service, published, deleted) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Up);
        assert_eq!(published, 1);
        assert_eq!(deleted, 1);

        // delete comes after both publishes
        let calls = store.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], Call::Delete(endpoint_path("node-c")));
    }

    #[tokio::test]
    async fn test_repeated_pass_issues_no_deletes() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));
        let backends = vec![backend("node-a", "10.1.2.3"), backend("node-b", "10.1.2.4")];

        engine.reconcile_service(pass(backends.clone())).await.unwrap();
        engine.reconcile_service(pass(backends)).await.unwrap();

        assert!(store.deletes().is_empty());
        assert_eq!(engine.endpoint_sets().get(&web()).map(|s| s.len()), Some(2));
    }

    #[tokio::test]
    async fn test_service_without_external_address_is_untouched() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));

        let mut no_address = pass(vec![backend("node-a", "10.1.2.3")]);
        no_address.external_address = None;

        let report = engine.reconcile_service(no_address).await.unwrap();
        assert_eq!(report, PassReport::Skipped);
        assert!(store.calls().is_empty());
        assert_eq!(*routes.reads.lock().unwrap(), 0);
        assert!(engine.endpoint_sets().is_empty());
    }

    #[tokio::test]
    async fn test_unprogrammed_route_publishes_only_service() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("pending")));

        let report = engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        let (service, published, _) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Down);
        assert_eq!(
            service.reason(),
            Some(ServiceReason::ExternalAddressNotProgrammed)
        );
        assert_eq!(published, 0);
        assert_eq!(
            store.calls(),
            vec![Call::Publish(
                service_path(),
                json!({
                    "oper_state": {"value": "down"},
                    "oper_reason": {"value": "external-address-not-programmed"}
                })
            )]
        );
    }

    #[tokio::test]
    async fn test_missing_route_reports_no_route() {
        let (_store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(json!({"ipv4-unicast": {"route": []}})));

        let report = engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        let (service, published, _) = completed(report);
        assert_eq!(service.reason(), Some(ServiceReason::ExternalAddressNoRoute));
        assert_eq!(published, 0);
    }

    #[tokio::test]
    async fn test_unreadable_route_table_marks_endpoints_down() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(None);

        let report = engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        let (service, published, _) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Down);
        assert_eq!(service.reason(), Some(ServiceReason::ExternalAddressNoRoute));
        assert_eq!(published, 1);

        match &store.calls()[0] {
            Call::Publish(_, v) => {
                assert_eq!(v["oper_state"]["value"], "down");
                assert_eq!(v["host_address"]["value"], "10.1.2.3");
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_backends_cleans_up_previous_endpoints() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));

        engine
            .reconcile_service(pass(vec![
                backend("node-a", "10.1.2.3"),
                backend("node-b", "10.1.2.4"),
            ]))
            .await
            .unwrap();
        store.clear();

        let report = engine.reconcile_service(pass(vec![])).await.unwrap();
        let (_, published, deleted) = completed(report);
        assert_eq!(published, 0);
        assert_eq!(deleted, 2);
        assert_eq!(
            store.deletes(),
            vec![endpoint_path("node-a"), endpoint_path("node-b")]
        );
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_abort_pass() {
        let (store, routes, mut engine) = setup(FakeStore {
            reject_publishes: true,
            ..Default::default()
        });
        routes.set(Some(table("success")));

        let report = engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        let (_, published, _) = completed(report);
        assert_eq!(published, 0);
        // endpoint and service publish were both attempted
        assert_eq!(store.calls().len(), 2);
        assert!(engine.endpoint_sets().get(&web()).is_some());
    }

    #[tokio::test]
    async fn test_remove_service_deletes_subtree_and_forgets() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));

        engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        store.clear();

        engine.remove_service(&web()).await.unwrap();
        assert_eq!(store.calls(), vec![Call::Delete(service_path())]);
        assert!(engine.endpoint_sets().get(&web()).is_none());

        // a later pass starts from an empty set and deletes nothing
        store.clear();
        engine
            .reconcile_service(pass(vec![backend("node-b", "10.1.2.4")]))
            .await
            .unwrap();
        assert!(store.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_withdrawn_route_deletes_published_endpoints() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));
        engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();
        store.clear();

        routes.set(Some(json!({"ipv4-unicast": {"route": []}})));
        let report = engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();

        let (service, published, deleted) = completed(report);
        assert_eq!(service.reason(), Some(ServiceReason::ExternalAddressNoRoute));
        assert_eq!(published, 0);
        assert_eq!(deleted, 1);
        assert_eq!(
            store.calls(),
            vec![
                Call::Publish(
                    service_path(),
                    json!({
                        "oper_state": {"value": "down"},
                        "oper_reason": {"value": "external-address-no-route"}
                    })
                ),
                Call::Delete(endpoint_path("node-a")),
            ]
        );
        assert_eq!(engine.endpoint_sets().get(&web()).map(|s| s.len()), Some(0));
    }

    #[tokio::test]
    async fn test_route_leaving_fib_deletes_published_endpoints() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));
        let backends = vec![backend("node-a", "10.1.2.3"), backend("node-b", "10.1.2.4")];
        engine.reconcile_service(pass(backends.clone())).await.unwrap();
        store.clear();

        routes.set(Some(table("pending")));
        let report = engine.reconcile_service(pass(backends.clone())).await.unwrap();
        let (service, _, deleted) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Down);
        assert_eq!(deleted, 2);
        assert_eq!(
            store.deletes(),
            vec![endpoint_path("node-a"), endpoint_path("node-b")]
        );

        // once programmed again the endpoints come back without further deletes
        store.clear();
        routes.set(Some(table("success")));
        let report = engine.reconcile_service(pass(backends)).await.unwrap();
        let (service, published, deleted) = completed(report);
        assert_eq!(service.state(), ServiceOperState::Up);
        assert_eq!((published, deleted), (2, 0));
    }

    #[tokio::test]
    async fn test_recovered_service_clears_reason() {
        let (store, routes, mut engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));
        engine
            .reconcile_service(pass(vec![backend("node-a", "10.9.9.9")]))
            .await
            .unwrap();
        store.clear();

        engine
            .reconcile_service(pass(vec![backend("node-a", "10.1.2.3")]))
            .await
            .unwrap();

        let calls = store.calls();
        assert_eq!(
            calls[0],
            Call::Publish(
                endpoint_path("node-a"),
                json!({
                    "oper_state": {"value": "up"},
                    "oper_reason": {"value": ""},
                    "fib_programmed": {"value": true},
                    "host_address": {"value": "10.1.2.3"}
                })
            )
        );
        assert_eq!(
            calls[1],
            Call::Publish(
                service_path(),
                json!({"oper_state": {"value": "up"}, "oper_reason": {"value": ""}})
            )
        );
    }

    #[tokio::test]
    async fn test_remove_unpublished_service_is_noop() {
        let (store, _routes, mut engine) = setup(FakeStore::default());

        engine
            .handle(ReconcileRequest::Remove(ServiceIdentity::new(
                "internal", "default",
            )))
            .await
            .unwrap();

        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_queue_in_order() {
        let (store, routes, engine) = setup(FakeStore::default());
        routes.set(Some(table("success")));
        let (handle, rx) = ReconcileHandle::channel(8);

        handle
            .submit(ReconcileRequest::Pass(pass(vec![backend("node-a", "10.1.2.3")])))
            .await
            .unwrap();
        handle
            .submit(ReconcileRequest::Remove(web()))
            .await
            .unwrap();
        drop(handle);

        engine.run(rx).await.unwrap();

        let calls = store.calls();
        assert_eq!(calls.last(), Some(&Call::Delete(service_path())));
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn test_submit_after_engine_stopped_is_fatal() {
        let (handle, rx) = ReconcileHandle::channel(1);
        drop(rx);

        let err = handle
            .submit(ReconcileRequest::Remove(web()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed(_)));
        assert!(err.is_fatal());
    }
}
