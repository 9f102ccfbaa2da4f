// tests/scheduler.rs — end-to-end scheduling scenarios on simulated devices

use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use labsched::driver::Driver;
use labsched::{ChannelMode, QueueName, Scheduler, SubTask, Task, TaskType};

fn scheduler() -> (tempfile::TempDir, Scheduler) {
    let dir = tempfile::tempdir().unwrap();
    let sched = Scheduler::new(dir.path(), Duration::from_secs(1)).unwrap();
    (dir, sched)
}

fn init_task(device: &str, device_type: &str, channels: usize, sample_mixing: bool) -> Task {
    Task::new(
        TaskType::Init,
        vec![SubTask {
            device: device.into(),
            device_type: Some(device_type.into()),
            number_of_channels: channels,
            simulated: true,
            sample_mixing,
            ..SubTask::default()
        }],
    )
}

fn init_task_with_mode(
    device: &str,
    device_type: &str,
    channels: usize,
    mode: ChannelMode,
) -> Task {
    let mut task = init_task(device, device_type, channels, true);
    task.tasks[0].channel_mode = Some(mode);
    task
}

fn sampled(mut task: Task, sample_id: Option<Uuid>) -> Task {
    task.sample_id = sample_id;
    task
}

fn prepare(device: &str, sample_id: Option<Uuid>) -> Task {
    sampled(
        Task::new(
            TaskType::Prepare,
            vec![SubTask {
                device: device.into(),
                ..SubTask::default()
            }],
        ),
        sample_id,
    )
}

fn measure(device: &str, channel: Option<usize>, sample_id: Option<Uuid>) -> Task {
    sampled(
        Task::new(
            TaskType::Measure,
            vec![SubTask {
                device: device.into(),
                channel,
                ..SubTask::default()
            }],
        ),
        sample_id,
    )
}

fn transfer(
    source: &str,
    target: &str,
    target_channel: Option<usize>,
    sample_id: Option<Uuid>,
) -> Task {
    sampled(
        Task::new(
            TaskType::Transfer,
            vec![
                SubTask {
                    device: source.into(),
                    ..SubTask::default()
                },
                SubTask {
                    device: target.into(),
                    channel: target_channel,
                    ..SubTask::default()
                },
            ],
        ),
        sample_id,
    )
}

/// Polls until update_active collects something.
fn wait_collected(sched: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if sched.update_active() {
            return;
        }
        assert!(Instant::now() < deadline, "no task was collected in time");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Dispatches one task (retrying while devices settle) and collects it.
fn dispatch_and_collect(sched: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if sched.execute_one() {
            break;
        }
        assert!(Instant::now() < deadline, "no task was dispatched in time");
        thread::sleep(Duration::from_millis(10));
    }
    wait_collected(sched);
}

fn drive_until_drained(sched: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        sched.update_active();
        sched.execute_one();
        if sched.drained().unwrap() {
            return;
        }
        assert!(Instant::now() < deadline, "queues did not drain in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn queue_of(sched: &Scheduler, task_id: Uuid) -> Option<QueueName> {
    sched.task_status(task_id).unwrap().map(|r| r.queue)
}

#[test]
fn s1_init_and_measure_happy_path() {
    let (_dir, sched) = scheduler();

    let (init_id, sample_number, _) = sched.queue_put(init_task("qcmd1", "qcmd", 1, true)).unwrap();
    assert_eq!(sample_number, 1);
    dispatch_and_collect(&sched);
    assert_eq!(queue_of(&sched, init_id), Some(QueueName::History));
    assert_eq!(sched.channel_occupancy("qcmd1").unwrap().len(), 1);

    // no sample identity given: the measure shares the default sample 1
    let (measure_id, sample_number, _) = sched.queue_put(measure("qcmd1", Some(0), None)).unwrap();
    assert_eq!(sample_number, 1);

    assert!(sched.execute_one());
    assert_eq!(queue_of(&sched, measure_id), Some(QueueName::Active));
    wait_collected(&sched);
    assert_eq!(queue_of(&sched, measure_id), Some(QueueName::History));

    // the measure task now occupies the channel it measured on
    let occupancy = sched.channel_occupancy("qcmd1").unwrap();
    let occupant = occupancy[0].as_ref().expect("channel 0 must be occupied");
    assert_eq!(occupant.task_id, measure_id);

    // the simulated instrument produced the dummy dataset
    let collected = sched
        .history_inspect()
        .unwrap()
        .into_iter()
        .find(|t| t.id == measure_id)
        .unwrap();
    let data = collected.tasks[0].md.get("measurement_data").unwrap();
    assert_eq!(data["frequency"][1], -1.0);
}

#[test]
fn s2_two_samples_share_a_non_mixing_qcmd() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("qcmd1", "qcmd", 2, false)).unwrap();
    sched.queue_put(init_task("lh1", "lh", 10, true)).unwrap();

    let sample_a = Some(Uuid::new_v4());
    let sample_b = Some(Uuid::new_v4());
    let (_, n_a, _) = sched.queue_put(prepare("lh1", sample_a)).unwrap();
    sched.queue_put(transfer("lh1", "qcmd1", Some(0), sample_a)).unwrap();
    sched.queue_put(measure("qcmd1", Some(0), sample_a)).unwrap();
    let (_, n_b, _) = sched.queue_put(prepare("lh1", sample_b)).unwrap();
    sched.queue_put(transfer("lh1", "qcmd1", Some(1), sample_b)).unwrap();
    sched.queue_put(measure("qcmd1", Some(1), sample_b)).unwrap();
    assert!(n_a < n_b);

    drive_until_drained(&sched);

    // 2 inits + 2 prepares + 2 transfers + 2 measures
    assert_eq!(sched.history_inspect().unwrap().len(), 8);

    let occupancy = sched.channel_occupancy("qcmd1").unwrap();
    assert_eq!(occupancy[0].as_ref().unwrap().sample_number, n_a);
    assert_eq!(occupancy[1].as_ref().unwrap().sample_number, n_b);

    // transfers moved the material off the liquid handler
    let lh = sched.channel_occupancy("lh1").unwrap();
    assert!(lh.iter().all(Option::is_none));
}

#[test]
fn s3_route_block_on_single_channel_qcmd() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("qcmd1", "qcmd", 1, false)).unwrap();
    sched.queue_put(init_task("lh1", "lh", 10, true)).unwrap();

    let sample_a = Some(Uuid::new_v4());
    let sample_b = Some(Uuid::new_v4());
    sched.queue_put(prepare("lh1", sample_a)).unwrap();
    let (transfer_a, _, _) = sched
        .queue_put(transfer("lh1", "qcmd1", Some(0), sample_a))
        .unwrap();
    sched.queue_put(measure("qcmd1", Some(0), sample_a)).unwrap();
    let (prepare_b, _, _) = sched.queue_put(prepare("lh1", sample_b)).unwrap();
    sched.queue_put(transfer("lh1", "qcmd1", Some(0), sample_b)).unwrap();
    sched.queue_put(measure("qcmd1", Some(0), sample_b)).unwrap();

    // While any sample-A work is ahead of sample B, qcmd1 (one channel, no
    // sample mixing) must keep sample B off its projected path: the sample-B
    // prepare may only dispatch after the sample-A transfer through qcmd1
    // completed.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        sched.update_active();
        sched.execute_one();

        if queue_of(&sched, prepare_b) != Some(QueueName::Scheduled) {
            assert_eq!(
                queue_of(&sched, transfer_a),
                Some(QueueName::History),
                "sample-B prepare dispatched before the sample-A transfer completed"
            );
            break;
        }
        assert!(
            Instant::now() < deadline,
            "sample-B prepare never dispatched"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn s4_cancel_active_with_drop_material() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("qcmd1", "qcmd", 1, true)).unwrap();
    dispatch_and_collect(&sched);

    let sample = Some(Uuid::new_v4());
    let mut task = measure("qcmd1", Some(0), sample);
    task.tasks[0].acquisition_time = Some(1.0);
    let (measure_id, _, _) = sched.queue_put(task).unwrap();
    assert!(sched.execute_one());
    assert_eq!(queue_of(&sched, measure_id), Some(QueueName::Active));

    let cancelled = sched.queue_cancel(measure_id, true, true).unwrap();
    assert_eq!(cancelled.unwrap().id, measure_id);
    assert_eq!(queue_of(&sched, measure_id), None);

    // the occupancy slot referencing the task is empty again
    let occupancy = sched.channel_occupancy("qcmd1").unwrap();
    assert!(occupancy[0].is_none());

    // a follow-up measure for the same sample has no material to find
    let (retry_id, _, _) = sched.queue_put(measure("qcmd1", None, sample)).unwrap();
    assert!(!sched.execute_one());
    let report = sched.task_status(retry_id).unwrap().unwrap();
    assert_eq!(report.queue, QueueName::Scheduled);
    assert!(report
        .submission_response
        .unwrap()
        .contains("Did not find the sample to measure"));
}

#[test]
fn s5_resubmission_preserves_priority() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("qcmd1", "qcmd", 2, true)).unwrap();
    dispatch_and_collect(&sched);

    let sample = Some(Uuid::new_v4());
    let (first_id, _, _) = sched.queue_put(measure("qcmd1", Some(0), sample)).unwrap();
    let (second_id, _, _) = sched.queue_put(measure("qcmd1", Some(1), sample)).unwrap();

    // dispatch the first task, let its busy window elapse, but do not
    // collect it: it stays active
    assert!(sched.execute_one());
    assert_eq!(queue_of(&sched, first_id), Some(QueueName::Active));
    thread::sleep(Duration::from_millis(100));

    sched.queue_cancel(first_id, true, true).unwrap();
    assert_eq!(queue_of(&sched, first_id), None);

    let mut replacement = measure("qcmd1", Some(0), sample);
    replacement.tasks[0].method_data = serde_json::json!({ "flow_rate": 2.0 });
    let (resubmitted_id, _, _) = sched.resubmit(first_id, Some(replacement)).unwrap();
    assert_eq!(resubmitted_id, first_id);

    // the replacement kept the cancelled task's priority and therefore
    // dispatches before the second task
    assert!(sched.execute_one());
    assert_eq!(queue_of(&sched, first_id), Some(QueueName::Active));
    assert_eq!(queue_of(&sched, second_id), Some(QueueName::Scheduled));
}

#[test]
fn s6_dependency_gating_ends_the_dispatch_cycle() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("lh1", "lh", 5, true)).unwrap();
    dispatch_and_collect(&sched);

    // this sample is permanently parked on an unregistered device
    let (blocked_id, blocked_number, _) = sched
        .queue_put(prepare("lh9", Some(Uuid::new_v4())))
        .unwrap();

    // a later sample is dispatchable but depends on the parked one
    let mut gated = prepare("lh1", Some(Uuid::new_v4()));
    gated.dependency_sample_number = Some(blocked_number);
    let (gated_id, _, _) = sched.queue_put(gated).unwrap();

    let stalls_before = sched.dependency_stalls();
    for _ in 0..3 {
        assert!(!sched.execute_one());
    }
    assert_eq!(queue_of(&sched, blocked_id), Some(QueueName::Scheduled));
    assert_eq!(queue_of(&sched, gated_id), Some(QueueName::Scheduled));
    assert!(sched.dependency_stalls() > stalls_before);
}

#[test]
fn reuse_mode_prefers_the_prior_channel() {
    let (_dir, sched) = scheduler();

    sched
        .queue_put(init_task_with_mode("lh1", "lh", 3, ChannelMode::Reuse))
        .unwrap();
    dispatch_and_collect(&sched);

    let sample = Some(Uuid::new_v4());
    sched.queue_put(prepare("lh1", sample)).unwrap();
    dispatch_and_collect(&sched);

    // move the material out through a non-channel buffer; channel 0 frees up
    let mut out = Task::new(
        TaskType::Transfer,
        vec![
            SubTask {
                device: "lh1".into(),
                ..SubTask::default()
            },
            SubTask {
                device: "lh1".into(),
                non_channel_storage: Some("waste".into()),
                ..SubTask::default()
            },
        ],
    );
    out.sample_id = sample;
    sched.queue_put(out).unwrap();
    dispatch_and_collect(&sched);
    assert!(sched.channel_occupancy("lh1").unwrap()[0].is_none());

    // the next prepare for the same sample lands on channel 0 again
    let (again, _, _) = sched.queue_put(prepare("lh1", sample)).unwrap();
    dispatch_and_collect(&sched);
    let collected = sched
        .history_inspect()
        .unwrap()
        .into_iter()
        .find(|t| t.id == again)
        .unwrap();
    assert_eq!(collected.tasks[0].channel, Some(0));
}

#[test]
fn new_mode_avoids_used_channels() {
    let (_dir, sched) = scheduler();

    sched
        .queue_put(init_task_with_mode("lh1", "lh", 3, ChannelMode::New))
        .unwrap();
    dispatch_and_collect(&sched);

    let sample = Some(Uuid::new_v4());
    sched.queue_put(prepare("lh1", sample)).unwrap();
    dispatch_and_collect(&sched);

    let (second, _, _) = sched.queue_put(prepare("lh1", sample)).unwrap();
    dispatch_and_collect(&sched);
    let collected = sched
        .history_inspect()
        .unwrap()
        .into_iter()
        .find(|t| t.id == second)
        .unwrap();
    // channel 0 was used by the first prepare; new-mode selection skips it
    assert_eq!(collected.tasks[0].channel, Some(1));
}

#[test]
fn shutdown_waits_for_higher_bands() {
    let (_dir, sched) = scheduler();

    let (init_id, _, _) = sched.queue_put(init_task("qcmd1", "qcmd", 1, true)).unwrap();
    let down = Task::new(
        TaskType::Shutdown,
        vec![SubTask {
            device: "qcmd1".into(),
            ..SubTask::default()
        }],
    );
    let (shutdown_id, _, _) = sched.queue_put(down).unwrap();

    // the init band always dispatches first
    assert!(sched.execute_one());
    assert_eq!(queue_of(&sched, init_id), Some(QueueName::Active));
    assert_eq!(queue_of(&sched, shutdown_id), Some(QueueName::Scheduled));

    wait_collected(&sched);
    dispatch_and_collect(&sched);
    assert_eq!(queue_of(&sched, shutdown_id), Some(QueueName::History));
}

#[test]
fn interference_blocks_same_device_channel() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("qcmd1", "qcmd", 1, true)).unwrap();
    dispatch_and_collect(&sched);

    let sample = Some(Uuid::new_v4());
    sched.queue_put(measure("qcmd1", Some(0), sample)).unwrap();
    assert!(sched.execute_one());

    // let the channel idle again without collecting the first measure: the
    // occupancy check passes (the slot belongs to this sample) and the
    // channel reports ready, so only the interference check can catch the
    // still-active task on the same (device, channel)
    thread::sleep(Duration::from_millis(100));
    let (second, _, _) = sched.queue_put(measure("qcmd1", Some(0), sample)).unwrap();
    assert!(!sched.execute_one());
    let report = sched.task_status(second).unwrap().unwrap();
    assert_eq!(report.queue, QueueName::Scheduled);
    assert!(report
        .submission_response
        .unwrap()
        .contains("Waiting for ongoing task"));
}

#[test]
fn paused_driver_does_not_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let sched = std::sync::Arc::new(Scheduler::new(dir.path(), Duration::from_secs(1)).unwrap());
    sched.pause();

    let mut driver = Driver::spawn(
        sched.clone(),
        Duration::from_millis(10),
        Duration::from_millis(20),
    );

    let (task_id, _, _) = sched.queue_put(init_task("qcmd1", "qcmd", 1, true)).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(queue_of(&sched, task_id), Some(QueueName::Scheduled));

    sched.resume();
    let deadline = Instant::now() + Duration::from_secs(5);
    while queue_of(&sched, task_id) != Some(QueueName::History) {
        assert!(Instant::now() < deadline, "task never ran after resume");
        thread::sleep(Duration::from_millis(10));
    }
    driver.stop();
}

#[test]
fn restart_clears_devices_but_keeps_history() {
    let (_dir, sched) = scheduler();

    sched.queue_put(init_task("qcmd1", "qcmd", 1, true)).unwrap();
    dispatch_and_collect(&sched);
    assert!(sched.channel_occupancy("qcmd1").is_some());
    let history_len = sched.history_inspect().unwrap().len();
    assert!(history_len > 0);

    sched.restart().unwrap();
    assert!(sched.channel_occupancy("qcmd1").is_none());
    assert_eq!(sched.history_inspect().unwrap().len(), history_len);

    // a measure for the cleared device now parks on the missing registration
    let (retry, _, _) = sched
        .queue_put(measure("qcmd1", Some(0), Some(Uuid::new_v4())))
        .unwrap();
    assert!(!sched.execute_one());
    assert_eq!(queue_of(&sched, retry), Some(QueueName::Scheduled));
}
