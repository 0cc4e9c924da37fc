use fusehpm::domain::types::{CpuId, Label, Strategy};
use fusehpm::profile::{ExecutionProfile, Instance};
use fusehpm::target::Target;

fn write_descriptor(dir: &std::path::Path) {
    let json = serde_json::json!({
        "binary": "bench",
        "binary_directory": "/opt/bench",
        "runtime": "openmp",
        "target_events": ["Cycles", "Instructions"],
        "references_directory": "references",
        "tracefiles_directory": "tracefiles",
        "combinations_directory": "combinations",
        "papi_directory": "/opt/papi",
    });
    std::fs::write(dir.join("fuse.json"), json.to_string()).unwrap();
}

#[test]
fn target_survives_a_save_reload_cycle_with_a_combined_profile_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(dir.path());

    let mut target = Target::load(dir.path()).unwrap();
    target.increment_num_reference_repeats();
    target.register_new_combined_profile(Strategy::Lgl, 0);

    let mut profile = ExecutionProfile::new(None, Some("bench".to_string()), None);
    profile.add_event("cycles".to_string());
    profile.add_event("instructions".to_string());
    let mut instance = Instance::new("foo".to_string(), Label(vec![0]), CpuId(0), 0, 100, false).unwrap();
    instance.set_event_value("cycles".to_string(), 1_000);
    instance.set_event_value("instructions".to_string(), 2_000);
    profile.add_instance(instance);

    let combined_path = target.get_combination_output_path(Strategy::Lgl, 0);
    profile.print_to_file(&combined_path).unwrap();
    target.save().unwrap();

    let reloaded = Target::load(dir.path()).unwrap();
    assert_eq!(reloaded.get_num_reference_repeats(), 1);
    assert_eq!(reloaded.get_combined_profile_indexes(Strategy::Lgl), vec![0]);

    let reloaded_profile = ExecutionProfile::load_from_file(&combined_path, reloaded.get_target_events()).unwrap();
    let only_instance = reloaded_profile.instance(0);
    assert_eq!(only_instance.symbol, "foo");
    assert_eq!(only_instance.get_event_value(&"cycles".to_string()), Some(1_000));
    assert_eq!(only_instance.get_event_value(&"instructions".to_string()), Some(2_000));
}
