//! End-to-end batch runs over the simulated driver.

use faultline_gateway::sim::SimGateway;
use faultline_gateway::{CpuFamily, DriverGateway, KernelVars};
use faultline_harness::orchestrator::{CommandPlan, HarnessOptions, TestOrchestrator};
use faultline_harness::topology::BindingCriterion;
use std::sync::Arc;
use std::time::Duration;

fn harness(sim: Arc<SimGateway>, dir: &tempfile::TempDir) -> TestOrchestrator {
    sim.set_kvars(KernelVars {
        debug_level: 2,
        error_reporting: 1,
        ce_throttle: 32,
    });
    let ncpus = sim.system_info().unwrap().ncpus_online;
    let opts = HarnessOptions {
        config_path: dir.path().join("faultline.conf"),
        bind_os_threads: false,
        expected_online: Some(ncpus),
        sync_timeout_us: 2_000_000,
        post_test_sleep: Duration::ZERO,
        ..HarnessOptions::default()
    };
    TestOrchestrator::new(sim, opts).unwrap()
}

#[test]
fn mixed_batch_runs_all_command_shapes() {
    let sim = Arc::new(SimGateway::uniform(4, CpuFamily::Heron));
    let dir = tempfile::tempdir().unwrap();
    let mut orch = harness(sim.clone(), &dir);

    let plans = vec![
        CommandPlan::new("enable"),
        CommandPlan::new("udce"),
        CommandPlan::new("kdue"),
        CommandPlan::new("uwbce"),
        CommandPlan::new("udcp"),
        CommandPlan::new("flushl2"),
    ];
    let errors = orch.run_batch(&plans);
    assert_eq!(errors, 0);

    // udce + kdue + uwbce + udcp inject; enable and flushl2 do not.
    assert_eq!(sim.injected().len(), 4);
    assert_eq!(sim.enabled().len(), 1);
    assert_eq!(sim.flushed().len(), 1);

    orch.shutdown().unwrap();
    assert!(!dir.path().join("faultline.conf").exists());
}

#[test]
fn concurrent_harnesses_share_the_config_record() {
    let sim = Arc::new(SimGateway::uniform(2, CpuFamily::Heron));
    let dir = tempfile::tempdir().unwrap();

    let mut first = harness(sim.clone(), &dir);
    let mut second = harness(sim.clone(), &dir);

    assert_eq!(first.run_batch(&[CommandPlan::new("udce")]), 0);
    assert_eq!(second.run_batch(&[CommandPlan::new("udue")]), 0);

    // First instance out leaves the record for the second.
    first.shutdown().unwrap();
    assert!(dir.path().join("faultline.conf").exists());
    assert_eq!(sim.kvar_writes(), 0);

    second.shutdown().unwrap();
    assert!(!dir.path().join("faultline.conf").exists());
    assert_eq!(sim.kvar_writes(), 1);
}

#[test]
fn kestrel_batch_translates_through_the_real_layer() {
    let sim = Arc::new(SimGateway::nodes(CpuFamily::Kestrel, &[0, 0]));
    sim.set_real_offset(0x20_0000_0000);
    let dir = tempfile::tempdir().unwrap();
    let mut orch = harness(sim.clone(), &dir);

    // Real-address command: the driver sees the raw real address; the
    // harness only chains translations when it needs locality.
    let errors = orch.run_batch(&[CommandPlan::new("rdce=0x7000")]);
    assert_eq!(errors, 0);
    assert_eq!(sim.injected()[0].target_addr, 0x7000);
    orch.shutdown().unwrap();
}

#[test]
fn binding_criteria_flow_through_to_the_request() {
    let sim = Arc::new(SimGateway::uniform(4, CpuFamily::Heron));
    let dir = tempfile::tempdir().unwrap();
    let mut orch = harness(sim.clone(), &dir);

    let mut plan = CommandPlan::new("udcp");
    plan.bindings = vec![BindingCriterion::ByCpuId(2), BindingCriterion::ByCpuId(0)];
    assert_eq!(orch.run_batch(&[plan]), 0);

    let req = &sim.injected()[0];
    assert_eq!(req.thread_cpu[0], 2);
    assert_eq!(req.thread_cpu[1], 0);
    orch.shutdown().unwrap();
}
