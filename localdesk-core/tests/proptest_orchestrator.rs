//! Property-based tests for descriptor argument building, output
//! classification and missing-model skipping.

use proptest::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use localdesk_core::events::EventBus;
use localdesk_core::process::{LineLevel, classify_line};
use localdesk_core::services::{
    LogFileResolver, ServiceDescriptor, ServiceManager, ServiceType, StartOutcome,
    log_file_env_key,
};

fn service_type() -> impl Strategy<Value = ServiceType> {
    prop_oneof![
        Just(ServiceType::Embedding),
        Just(ServiceType::Reranking),
        Just(ServiceType::VisionCompletion),
        Just(ServiceType::TextCompletion),
    ]
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

// --- Argument building ---

proptest! {
    #[test]
    fn test_args_start_with_the_fixed_prefix(
        service_type in service_type(),
        port in 1u16..,
        context in 1u32..65_536,
        threads in 1u32..64,
        gpu_layers in 0u32..1000,
        model in "[a-z]{1,12}\\.gguf",
    ) {
        let mut descriptor = ServiceDescriptor::new("svc", service_type, Path::new("/models").join(&model), port);
        descriptor.context_size = context;
        descriptor.threads = threads;
        descriptor.gpu_offload_layers = gpu_layers;
        let args = descriptor.build_args("127.0.0.1", None);

        let expected_model = format!("/models/{model}");
        let expected_port = port.to_string();
        let expected_context = context.to_string();
        let expected_threads = threads.to_string();
        let expected_layers = gpu_layers.to_string();
        let prefix = [
            "-m", expected_model.as_str(),
            "--host", "127.0.0.1",
            "--port", expected_port.as_str(),
            "-c", expected_context.as_str(),
            "-t", expected_threads.as_str(),
            "-ngl", expected_layers.as_str(),
        ];
        prop_assert_eq!(&args[..12], &prefix.map(String::from)[..]);
    }

    #[test]
    fn test_optional_flags_appear_only_when_set(
        service_type in service_type(),
        batch in proptest::option::of(1u32..16_384),
        micro_batch in proptest::option::of(1u32..16_384),
        projector in proptest::option::of("[a-z]{1,8}\\.gguf"),
        log_file in proptest::option::of("[a-z]{1,8}\\.log"),
    ) {
        let mut descriptor = ServiceDescriptor::new("svc", service_type, "/m/model.gguf", 8000)
            .with_batch_sizes(batch, micro_batch);
        if let Some(projector) = &projector {
            descriptor = descriptor.with_projector(Path::new("/m").join(projector));
        }
        let log_path = log_file.as_ref().map(|f| PathBuf::from("/logs").join(f));
        let args = descriptor.build_args("127.0.0.1", log_path.as_deref());

        prop_assert_eq!(flag_value(&args, "-b").map(str::to_string), batch.map(|b| b.to_string()));
        prop_assert_eq!(flag_value(&args, "-ub").map(str::to_string), micro_batch.map(|b| b.to_string()));

        let has_projector_flag = args.iter().any(|a| a == "--mmproj");
        prop_assert_eq!(
            has_projector_flag,
            projector.is_some() && service_type == ServiceType::VisionCompletion
        );
        prop_assert_eq!(args.iter().any(|a| a == "--embedding"), service_type == ServiceType::Embedding);
        prop_assert_eq!(args.iter().any(|a| a == "--reranking"), service_type == ServiceType::Reranking);

        if let Some(log_path) = &log_path {
            prop_assert_eq!(&args[args.len() - 2], "--log-file");
            prop_assert_eq!(args.last().map(String::as_str), Some(log_path.to_str().unwrap()));
        } else {
            prop_assert!(!args.iter().any(|a| a == "--log-file"));
        }
    }

    #[test]
    fn test_log_file_key_is_a_valid_env_name(alias in "[a-zA-Z0-9 ._-]{1,24}") {
        let key = log_file_env_key(&alias);
        prop_assert!(key.starts_with("LOCALDESK_"));
        prop_assert!(key.ends_with("_LOG_FILE"));
        prop_assert!(key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'));

        let resolver = LogFileResolver::from_vars([(key, "/tmp/x.log".to_string())]);
        prop_assert_eq!(resolver.resolve(&alias), Some(PathBuf::from("/tmp/x.log")));
    }
}

// --- Output classification ---

proptest! {
    #[test]
    fn test_lines_without_failure_vocabulary_are_info(line in "[b-df-zB-DF-Z0-9 :/._=-]{0,80}") {
        // Every failure word contains an `a` or an `e`.
        prop_assert_eq!(classify_line(&line), LineLevel::Info);
    }

    #[test]
    fn test_failure_lines_outside_benign_shapes_are_errors(
        word in prop_oneof![Just("error"), Just("FAILED"), Just("Exception"), Just("fatal"), Just("panic"), Just("crash")],
        rest in "[b-z ]{0,40}",
    ) {
        let line = format!("{word}: {rest}");
        prop_assert_eq!(classify_line(&line), LineLevel::Error);
    }

    #[test]
    fn test_successful_request_logs_are_info(
        method in prop_oneof![Just("GET"), Just("POST")],
        path in "/[a-z]{1,10}(-error)?",
        status in 200u16..400,
    ) {
        let line = format!("srv  log_server_r: request: {method} {path} 127.0.0.1 {status}");
        prop_assert_eq!(classify_line(&line), LineLevel::Info);
    }
}

// --- Missing models never register ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_missing_model_is_always_skipped(
        alias in "[a-z]{1,12}",
        service_type in service_type(),
        file in "[a-z]{1,12}\\.gguf",
    ) {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("llama-server");
        std::fs::write(&binary, b"").unwrap();
        let model = dir.path().join("absent").join(&file);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let (outcome, running) = rt.block_on(async {
            let manager = ServiceManager::new(&binary, "127.0.0.1", Duration::from_secs(1), EventBus::new())
                .with_log_files(LogFileResolver::default());
            let descriptor = ServiceDescriptor::new(alias.clone(), service_type, &model, 9100);
            let outcome = manager.start_service(descriptor).await.unwrap();
            (outcome, manager.is_running(&alias))
        });

        prop_assert_eq!(outcome, StartOutcome::SkippedMissingModel { model_path: model });
        prop_assert!(!running);
    }
}
