#[cfg(test)]
mod integration_tests {
    use crate::*;
    use anyhow::anyhow;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn calculator_config(id: &str) -> ComponentConfig {
        ComponentConfig::new(id, "Calculator", "1.0.0", Language::Python)
            .with_method(MethodSignature::new(
                "add",
                vec![ValueType::Int64, ValueType::Int64],
                ValueType::Int64,
            ))
            .with_method(
                MethodSignature::new("peek", vec![], ValueType::Int64).requires(Permissions::MEMORY_READ),
            )
    }

    fn calculator(calls: Arc<AtomicUsize>) -> Arc<dyn ComponentInstance> {
        let peeks = calls.clone();
        Arc::new(
            FunctionTable::new()
                .method("add", move |params| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let a: i64 = from_neutral(&params[0])?;
                    let b: i64 = from_neutral(&params[1])?;
                    Ok(TaggedValue::integer(a + b))
                })
                .method("peek", move |_| {
                    peeks.fetch_add(1, Ordering::SeqCst);
                    Ok(TaggedValue::Int64(7))
                }),
        )
    }

    fn sleeper(ms: u64) -> Arc<dyn ComponentInstance> {
        Arc::new(FunctionTable::new().async_method("work", move |_| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, anyhow::Error>(TaggedValue::Null)
        }))
    }

    fn ready_adapter() -> DopAdapter {
        init_logging();
        let adapter = DopAdapter::new();
        adapter.initialize(None).unwrap();
        adapter
    }

    fn int_args(a: i64, b: i64) -> Vec<TaggedValue> {
        vec![to_neutral(&a), to_neutral(&b)]
    }

    #[tokio::test]
    async fn test_scenario_a_add() {
        let adapter = ready_adapter();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = adapter
            .register_component(calculator_config("calc_001"), calculator(calls.clone()))
            .await
            .unwrap();

        let result = adapter
            .invoke("calc_001", "add", int_args(2, 3), InvokeOptions::default())
            .await
            .unwrap();

        assert_eq!(from_neutral::<i64>(&result).unwrap(), 5);
        assert_eq!(handle.state(), ComponentState::Ready);
        assert_eq!(handle.stats().invocation_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scenario_b_unknown_component() {
        let adapter = ready_adapter();
        adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();

        let err = adapter
            .invoke("ghost", "add", int_args(1, 2), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdapterError::ComponentNotFound {
                component_id: "ghost".to_string()
            }
        );
        assert_eq!(err.class(), ErrorClass::FixCall);
        assert_eq!(adapter.list_components(), vec!["calc_001"]);
    }

    #[tokio::test]
    async fn test_scenario_c_duplicate_registration() {
        let adapter = ready_adapter();
        adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();

        let err = adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::DuplicateComponent { .. }));
        assert_eq!(adapter.list_components(), vec!["calc_001"]);
    }

    #[tokio::test]
    async fn test_scenario_d_paranoid_denies_memory_read() {
        let adapter = DopAdapter::new();
        adapter
            .initialize(Some(AdapterConfig::with_isolation(IsolationLevel::Paranoid)))
            .unwrap();

        let violations = Arc::new(Mutex::new(Vec::new()));
        let sink = violations.clone();
        adapter.on(EventKind::SecurityViolation, move |event| {
            if let AdapterEvent::SecurityViolation { detail, .. } = event {
                sink.lock().push(detail.clone());
            }
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let handle = adapter
            .register_component(calculator_config("calc_001"), calculator(calls.clone()))
            .await
            .unwrap();
        assert_eq!(handle.policy().isolation_level, IsolationLevel::Paranoid);

        let err = adapter
            .invoke("calc_001", "peek", vec![], InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdapterError::PermissionDenied {
                component_id: "calc_001".to_string(),
                method: "peek".to_string(),
                permission: Permissions::MEMORY_READ,
            }
        );

        assert_eq!(handle.stats().security_violations, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            *violations.lock(),
            vec![ViolationDetail::Permission {
                missing: Permissions::MEMORY_READ
            }]
        );
        assert_eq!(adapter.get_statistics().unwrap().denied_invocations, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_e_concurrent_calls_fail_fast() {
        let adapter = Arc::new(ready_adapter());
        let handle = adapter
            .register_component(
                ComponentConfig::new("busy", "Busy", "1.0.0", Language::JavaScript),
                sleeper(200),
            )
            .await
            .unwrap();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let adapter = adapter.clone();
                tokio::spawn(async move {
                    adapter
                        .invoke("busy", "work", vec![], InvokeOptions::default())
                        .await
                })
            })
            .collect();

        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(AdapterError::InvalidState {
                        state: ComponentState::Executing,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(busy, 1);

        let stats = handle.stats();
        assert_eq!(stats.invocation_count, 1);
        assert_eq!(stats.successful_invocations, 1);
        assert_eq!(stats.rejected_invocations, 1);
        assert_eq!(handle.state(), ComponentState::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_components_run_in_parallel() {
        let adapter = Arc::new(ready_adapter());
        for id in ["left", "right"] {
            adapter
                .register_component(ComponentConfig::new(id, "Sleeper", "1.0.0", Language::C), sleeper(150))
                .await
                .unwrap();
        }

        let started = Instant::now();
        let results = join_all(["left", "right"].map(|id| {
            let adapter = adapter.clone();
            async move { adapter.invoke(id, "work", vec![], InvokeOptions::default()).await }
        }))
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(started.elapsed() < Duration::from_millis(280));
        assert_eq!(adapter.get_statistics().unwrap().successful_invocations, 2);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let adapter = DopAdapter::new();
        assert!(!adapter.is_initialized());

        let err = adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(err, AdapterError::NotInitialized);
        assert_eq!(
            adapter
                .invoke("calc_001", "add", int_args(1, 1), InvokeOptions::default())
                .await
                .unwrap_err(),
            AdapterError::NotInitialized
        );
        assert_eq!(
            adapter.unregister_component("calc_001").await.unwrap_err(),
            AdapterError::NotInitialized
        );
        assert!(adapter.get_component("calc_001").is_none());
        assert!(adapter.list_components().is_empty());

        adapter.initialize(None).unwrap();
        assert_eq!(adapter.initialize(None).unwrap_err(), AdapterError::AlreadyInitialized);

        adapter.cleanup().await.unwrap();
        assert_eq!(adapter.cleanup().await.unwrap_err(), AdapterError::NotInitialized);
        adapter.initialize(None).unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_drains_and_reinitializes() {
        let adapter = ready_adapter();

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = events.clone();
            adapter.on(kind, move |event| sink.lock().push(event.kind()));
        }

        let sticky: Arc<dyn ComponentInstance> = Arc::new(
            FunctionTable::new()
                .method("noop", |_| Ok(TaggedValue::Null))
                .on_cleanup(|| Err(anyhow!("socket still open"))),
        );
        adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();
        adapter
            .register_component(ComponentConfig::new("sticky", "Sticky", "0.1.0", Language::C), sticky)
            .await
            .unwrap();

        adapter.cleanup().await.unwrap();
        assert!(!adapter.is_initialized());
        assert_eq!(
            *events.lock(),
            vec![
                EventKind::ComponentRegistered,
                EventKind::ComponentRegistered,
                EventKind::Cleanup
            ]
        );

        adapter.initialize(None).unwrap();
        assert!(adapter.list_components().is_empty());
        adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_component_in_error() {
        let adapter = ready_adapter();
        let sticky: Arc<dyn ComponentInstance> = Arc::new(
            FunctionTable::new()
                .method("noop", |_| Ok(TaggedValue::Null))
                .on_cleanup(|| Err(anyhow!("socket still open"))),
        );
        let handle = adapter
            .register_component(ComponentConfig::new("sticky", "Sticky", "0.1.0", Language::C), sticky)
            .await
            .unwrap();

        let err = adapter.unregister_component("sticky").await.unwrap_err();
        assert!(matches!(err, AdapterError::Cleanup { ref reason, .. } if reason.contains("socket still open")));
        assert_eq!(err.class(), ErrorClass::FixEnvironment);
        assert_eq!(handle.state(), ComponentState::Error);
        assert_eq!(adapter.list_components(), vec!["sticky"]);

        adapter.force_unregister_component("sticky").await.unwrap();
        assert_eq!(handle.state(), ComponentState::Destroyed);
        assert!(adapter.list_components().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_and_invocation_events() {
        let adapter = ready_adapter();
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let listener = adapter.on(EventKind::InvocationLogged, move |event| {
            if let AdapterEvent::InvocationLogged(record) = event {
                sink.lock().push(record.clone());
            }
        });

        adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();
        adapter
            .invoke("calc_001", "add", int_args(40, 2), InvokeOptions::default())
            .await
            .unwrap();
        adapter
            .invoke("calc_001", "sub", int_args(40, 2), InvokeOptions::default())
            .await
            .unwrap_err();

        {
            let records = records.lock();
            assert_eq!(records.len(), 2);
            assert_eq!(records[0].status, InvocationStatus::Success);
            assert_eq!(records[0].method, "add");
            assert!(records[0].error.is_none());
            assert_eq!(records[1].status, InvocationStatus::Failed);
            assert!(records[1].error.as_deref().unwrap_or_default().contains("sub"));
        }

        assert!(adapter.off(EventKind::InvocationLogged, listener));
        adapter.unregister_component("calc_001").await.unwrap();
        assert!(adapter.get_component("calc_001").is_none());
        assert_eq!(
            adapter
                .invoke("calc_001", "add", int_args(1, 1), InvokeOptions::default())
                .await
                .unwrap_err(),
            AdapterError::ComponentNotFound {
                component_id: "calc_001".to_string()
            }
        );
        assert_eq!(records.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_abort_register() {
        let adapter = ready_adapter();
        adapter.on(EventKind::ComponentRegistered, |_| panic!("telemetry sink down"));

        let handle = adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();
        assert_eq!(handle.state(), ComponentState::Ready);
        assert_eq!(adapter.list_components(), vec!["calc_001"]);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let adapter = ready_adapter();
        let handle = adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();

        adapter.suspend_component("calc_001").unwrap();
        assert_eq!(handle.state(), ComponentState::Suspended);
        let err = adapter
            .invoke("calc_001", "add", int_args(1, 1), InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::InvalidState {
                state: ComponentState::Suspended,
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::RetryLater);
        assert!(adapter.suspend_component("calc_001").is_err());

        adapter.resume_component("calc_001").unwrap();
        assert!(adapter.resume_component("calc_001").is_err());
        adapter
            .invoke("calc_001", "add", int_args(1, 1), InvokeOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_reported_to_caller() {
        let adapter = ready_adapter();
        let handle = adapter
            .register_component(ComponentConfig::new("slow", "Slow", "1.0.0", Language::Jvm), sleeper(1_000))
            .await
            .unwrap();

        let started = Instant::now();
        let err = adapter
            .invoke("slow", "work", vec![], InvokeOptions::with_timeout_ms(25))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(800));
        assert!(matches!(err, AdapterError::Timeout { limit_ms: 25, .. }));
        assert_eq!(handle.state(), ComponentState::Error);

        let stats = adapter.get_statistics().unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.security_violations, 1);
        assert_eq!(stats.components_by_state.get("ERROR"), Some(&1));
    }

    #[tokio::test]
    async fn test_abandoned_invoke_does_not_wedge_component() {
        let adapter = ready_adapter();
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        adapter.on(EventKind::InvocationLogged, move |event| {
            if let AdapterEvent::InvocationLogged(record) = event {
                sink.lock().push(record.clone());
            }
        });
        let handle = adapter
            .register_component(ComponentConfig::new("w", "Worker", "1.0.0", Language::Python), sleeper(300))
            .await
            .unwrap();

        // Caller gives up long before the instance finishes
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            adapter.invoke("w", "work", vec![], InvokeOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(handle.state(), ComponentState::Error);
        let stats = handle.stats();
        assert_eq!(stats.invocation_count, 1);
        assert_eq!(stats.failed_invocations, 1);
        {
            let records = records.lock();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].status, InvocationStatus::Failed);
            assert!(records[0].error.as_deref().unwrap_or_default().contains("cancelled"));
        }
        assert_eq!(adapter.get_statistics().unwrap().failed_invocations, 1);

        adapter.unregister_component("w").await.unwrap();
        assert_eq!(handle.state(), ComponentState::Destroyed);
        assert!(adapter.list_components().is_empty());
    }

    #[tokio::test]
    async fn test_memory_reservation_over_paranoid_ceiling() {
        let adapter = DopAdapter::new();
        adapter
            .initialize(Some(AdapterConfig::with_isolation(IsolationLevel::Paranoid)))
            .unwrap();

        let reserved = IsolationLevel::Paranoid.memory_ceiling() * 2;
        let config = ComponentConfig::new("hog", "Hog", "1.0.0", Language::Wasm)
            .with_setting(RESERVED_MEMORY_KEY, reserved.to_string());
        adapter
            .register_component(config, Arc::new(FunctionTable::new().method("run", |_| Ok(TaggedValue::Null))))
            .await
            .unwrap();

        let report = adapter
            .invoke_detailed("hog", "run", vec![], InvokeOptions::default())
            .await
            .unwrap();
        assert!(report.observed_memory >= reserved);
        assert_eq!(
            report.compliance.memory_violation(),
            Some(ResourceViolation::Memory {
                limit: IsolationLevel::Paranoid.memory_ceiling(),
                observed: report.observed_memory,
            })
        );

        let stats = adapter.get_component_statistics("hog").unwrap();
        assert_eq!(stats.security_violations, 1);
        assert!(stats.memory_high_water >= reserved);
    }

    #[tokio::test]
    async fn test_config_overrides_reach_components() {
        let config = AdapterConfig::from_json_str(
            r#"{
                "default_isolation": "BASIC",
                "policy_overrides": { "additional_denied": ["MEMORY_READ"] },
                "max_components": 1
            }"#,
        )
        .unwrap();

        let adapter = DopAdapter::new();
        adapter.initialize(Some(config)).unwrap();

        let handle = adapter
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();
        assert!(!handle.policy().effective_permissions().contains(Permissions::MEMORY_READ));

        let err = adapter
            .invoke("calc_001", "peek", vec![], InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::PermissionDenied { .. }));

        let err = adapter
            .register_component(calculator_config("calc_002"), calculator(Arc::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::ResourceLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_provider_factory_failure_blocks_initialize() {
        let factory: ProviderFactory = Arc::new(|| Err(anyhow!("libpolycall.so not found")));
        let adapter = DopAdapter::with_provider_factory(factory);

        let err = adapter.initialize(None).unwrap_err();
        assert!(matches!(err, AdapterError::Provider { ref reason } if reason.contains("libpolycall.so")));
        assert!(!adapter.is_initialized());
    }

    #[tokio::test]
    async fn test_independent_adapters_share_nothing() {
        let first = ready_adapter();
        let second = ready_adapter();

        first
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();
        second
            .register_component(calculator_config("calc_001"), calculator(Arc::default()))
            .await
            .unwrap();

        first.cleanup().await.unwrap();
        assert_eq!(second.list_components(), vec!["calc_001"]);
        assert_eq!(first.get_statistics().unwrap_err(), AdapterError::NotInitialized);
        assert_eq!(second.get_statistics().unwrap().registered_components, 1);
    }
}
