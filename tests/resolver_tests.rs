use proptest::prelude::*;
use sensor_pipeline_lib::pipeline::{resolve, ConfigurationAccumulator};
use sensor_pipeline_lib::{
    ModuleRequirement, PipelineError, SimulatedBackend, StreamFormat, StreamKey, StreamKind, StreamRequest,
};

#[cfg(test)]
mod resolver_tests {
    use super::*;

    fn stream_kind() -> impl Strategy<Value = StreamKind> {
        prop_oneof![
            Just(StreamKind::Depth),
            Just(StreamKind::Color),
            Just(StreamKind::Infrared),
            Just(StreamKind::Gyro),
        ]
    }

    fn stream_request() -> impl Strategy<Value = StreamRequest> {
        (
            stream_kind(),
            0u32..3,
            prop_oneof![Just((0u32, 0u32)), Just((640, 480)), Just((1280, 720))],
            prop_oneof![Just(0u32), Just(15), Just(30), Just(90)],
        )
            .prop_map(|(kind, index, (width, height), fps)| {
                StreamRequest::video(kind, width, height, StreamFormat::Any, fps).with_index(index)
            })
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(
            requests in proptest::collection::vec(stream_request(), 0..5),
            with_selector in any::<bool>(),
        ) {
            let devices = SimulatedBackend::default_catalog();
            let mut acc = ConfigurationAccumulator::new();
            for request in &requests {
                acc.enable_stream(*request);
            }
            if with_selector {
                acc.enable_device("841612070098");
            }

            let first = resolve(&acc, &[], &devices);
            let second = resolve(&acc, &[], &devices);
            match (first, second) {
                (Ok(a), Ok(b)) => {
                    prop_assert_eq!(&a, &b);
                    let keys: Vec<StreamKey> = a.profiles().iter().map(|p| p.key()).collect();
                    let mut sorted = keys.clone();
                    sorted.sort();
                    sorted.dedup();
                    prop_assert_eq!(keys, sorted, "profiles must be distinct and ordered by key");
                    for request in acc.requests() {
                        prop_assert!(a.profiles().iter().any(|p| request.matches(p)));
                    }
                }
                (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
                (a, b) => prop_assert!(false, "resolution diverged: {:?} vs {:?}", a, b),
            }
        }
    }

    #[test]
    fn test_selector_restricts_candidates() {
        let devices = SimulatedBackend::default_catalog();
        let mut acc = ConfigurationAccumulator::new();
        acc.enable_device("WEBCAM-0001");
        acc.enable_stream(StreamRequest::any(StreamKind::Depth));

        // The depth camera would satisfy the request but is not selected
        assert!(matches!(
            resolve(&acc, &[], &devices),
            Err(PipelineError::ConfigurationUnsatisfiable { .. })
        ));
    }

    #[test]
    fn test_device_default_preferred_over_enumeration_order() {
        let devices = SimulatedBackend::default_catalog();
        let mut acc = ConfigurationAccumulator::new();
        acc.enable_stream(StreamRequest::any(StreamKind::Color));

        let active = resolve(&acc, &[], &devices).unwrap();
        let color = &active.profiles()[0];
        assert_eq!((color.width, color.height, color.uid), (1280, 720, 5));
    }

    #[test]
    fn test_any_default_mode_places_module_streams_first() {
        let devices = SimulatedBackend::default_catalog();
        let acc = ConfigurationAccumulator::new();
        let requirement = ModuleRequirement::new(
            "fast-depth",
            StreamRequest::video(StreamKind::Depth, 0, 0, StreamFormat::Any, 90),
        );

        let active = resolve(&acc, &[requirement], &devices).unwrap();
        let depth = active
            .profiles()
            .iter()
            .find(|p| p.kind == StreamKind::Depth)
            .unwrap();
        assert_eq!(depth.fps, 90);
        assert_eq!(active.profiles().len(), 4);
        assert_eq!(active.slowest_fps(), 30);
    }
}
