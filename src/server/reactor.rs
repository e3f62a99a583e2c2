use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::common::{Map, Set};
use crate::error::TaskFailure;
use crate::protocol::clientmsg::{
    KeySelection, ResultTree, ScheduleAckMsg, ScheduleErrorMsg, ScheduleMsg, TaskArg,
    TaskSpec, ToClientMessage,
};
use crate::protocol::codec::{MessageBuilder, Packet, Payload};
use crate::protocol::key::TaskKey;
use crate::protocol::workermsg::{ComputeMsg, DelItemMsg, GetItemMsg, SetItemMsg, ToWorkerMessage};
use crate::protocol::RequestId;
use crate::server::core::CoreRef;
use crate::server::replies::ReplyEvent;
use crate::server::task::{DataInfo, TaskRef, TaskRunState};
use crate::server::worker::{WorkerId, WorkerRef};
use crate::util::OptionExt;
use crate::TgError;

/// Everything `schedule` produces for the client: the requested key
/// shape and one gathered value per distinct result key.
pub struct ScheduleOutcome {
    pub keys: KeySelection,
    pub values: Map<TaskKey, Payload>,
}

/// Per-submission execution state, discarded when `schedule` returns.
struct RunState {
    tasks: Map<TaskKey, TaskRef>,
    ready: Vec<TaskRef>,
    /// Invocations not yet finished.
    pending: usize,
    result_keys: Set<TaskKey>,
}

/// Runs one graph submission to completion: scatters literal leaves,
/// dispatches ready tasks as workers free up, reacts to completion and
/// failure replies, gathers the requested keys and finally evicts the
/// submission's data from the workers.
///
/// Submissions are serialized process-wide; message intake keeps running
/// while one holds the lock.
pub async fn schedule(
    core_ref: &CoreRef,
    msg: ScheduleMsg<Payload>,
) -> crate::Result<ScheduleOutcome> {
    let lock = core_ref.get().schedule_lock.clone();
    let _guard = lock.lock().await;

    let keys = msg.keys.clone();
    let (mut run, cache) = build_run(core_ref, msg)?;
    log::debug!(
        "New submission: {} invocations, {} literals, {} result keys",
        run.pending,
        cache.len(),
        run.result_keys.len()
    );
    ensure_worker_available(core_ref).await?;
    scatter_literals(core_ref, &mut run, cache).await?;
    drive(core_ref, &mut run).await?;
    let values = gather(core_ref, &run).await;
    release_run_data(core_ref, &run);
    Ok(ScheduleOutcome {
        keys,
        values: values?,
    })
}

/// Partitions the graph into literal leaves and invocations, wires
/// dependency edges and checks that the submission can make progress at
/// all. Fails before any network traffic happens.
fn build_run(
    core_ref: &CoreRef,
    msg: ScheduleMsg<Payload>,
) -> crate::Result<(RunState, Vec<(TaskKey, Payload)>)> {
    let core = core_ref.get();

    let graph_keys: Set<TaskKey> = msg.graph.iter().map(|(key, _)| key.clone()).collect();
    if graph_keys.len() != msg.graph.len() {
        return Err(TgError::MalformedGraph("duplicate task keys".into()));
    }

    let mut tasks: Map<TaskKey, TaskRef> = Map::with_capacity(msg.graph.len());
    let mut cache: Vec<(TaskKey, Payload)> = Vec::new();
    let mut pending = 0;

    for (key, spec) in msg.graph {
        match spec {
            TaskSpec::Literal(value) => {
                tasks.insert(key.clone(), TaskRef::new(key.clone(), None, Vec::new(), 0));
                cache.push((key, value));
            }
            TaskSpec::Invocation(spec) => {
                let mut dependencies: Vec<TaskKey> = spec
                    .args
                    .iter()
                    .filter_map(|arg| match arg {
                        TaskArg::Key(k)
                            if graph_keys.contains(k) || core.locations.is_resident(k) =>
                        {
                            Some(k.clone())
                        }
                        _ => None,
                    })
                    .collect();
                dependencies.sort();
                dependencies.dedup();
                if dependencies.contains(&key) {
                    return Err(TgError::MalformedGraph(format!(
                        "task {} depends on itself",
                        key
                    )));
                }
                let unfinished = dependencies
                    .iter()
                    .filter(|dep| graph_keys.contains(*dep))
                    .count() as u32;
                pending += 1;
                tasks.insert(
                    key.clone(),
                    TaskRef::new(key, Some(spec), dependencies, unfinished),
                );
            }
        }
    }

    for task_ref in tasks.values() {
        let task = task_ref.get();
        for dep in &task.dependencies {
            if let Some(dep_ref) = tasks.get(dep) {
                dep_ref.get_mut().add_consumer(task_ref.clone());
            }
        }
    }

    let mut result_keys = Set::new();
    for key in msg.keys.flatten() {
        if !tasks.contains_key(&key) && !core.locations.is_resident(&key) {
            return Err(TgError::MalformedGraph(format!(
                "requested key {} is neither defined nor resident",
                key
            )));
        }
        result_keys.insert(key);
    }

    check_acyclic(&tasks)?;

    let mut ready = Vec::new();
    for task_ref in tasks.values() {
        let seed = {
            let task = task_ref.get();
            task.spec.is_some() && task.unfinished_inputs == 0
        };
        if seed {
            task_ref.get_mut().state = TaskRunState::Ready;
            ready.push(task_ref.clone());
        }
    }

    Ok((
        RunState {
            tasks,
            ready,
            pending,
            result_keys,
        },
        cache,
    ))
}

fn check_acyclic(tasks: &Map<TaskKey, TaskRef>) -> crate::Result<()> {
    let mut counts: Map<TaskKey, usize> = Map::with_capacity(tasks.len());
    let mut stack: Vec<TaskRef> = Vec::new();
    for task_ref in tasks.values() {
        let task = task_ref.get();
        let n = task
            .dependencies
            .iter()
            .filter(|dep| tasks.contains_key(*dep))
            .count();
        if n == 0 {
            stack.push(task_ref.clone());
        }
        counts.insert(task.key.clone(), n);
    }
    let mut processed = 0;
    while let Some(task_ref) = stack.pop() {
        processed += 1;
        for consumer in task_ref.get().get_consumers() {
            let key = consumer.get().key.clone();
            let count = counts.get_mut(&key).ensure();
            *count -= 1;
            if *count == 0 {
                stack.push(consumer.clone());
            }
        }
    }
    if processed != tasks.len() {
        return Err(TgError::MalformedGraph("dependency cycle detected".into()));
    }
    Ok(())
}

/// Waits until at least one worker is registered, within the configured
/// bound. The availability probe borrows a worker and puts it right
/// back.
async fn ensure_worker_available(core_ref: &CoreRef) -> crate::Result<()> {
    let (pool, wait) = {
        let core = core_ref.get();
        (core.pool.clone(), core.worker_wait)
    };
    let deadline = Instant::now() + wait;
    loop {
        if core_ref.get().has_workers() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TgError::NoCapacity(format!(
                "no worker registered within {:?}",
                wait
            )));
        }
        match tokio::time::timeout(deadline - now, pool.take_available()).await {
            Ok(id) => pool.return_available(id),
            Err(_) => {
                return Err(TgError::NoCapacity(format!(
                    "no worker registered within {:?}",
                    wait
                )))
            }
        }
    }
}

/// Pushes the submission's literal values to workers and waits for every
/// write to be acknowledged, recording locations as acks arrive.
async fn scatter_literals(
    core_ref: &CoreRef,
    run: &mut RunState,
    cache: Vec<(TaskKey, Payload)>,
) -> crate::Result<()> {
    if cache.is_empty() {
        return Ok(());
    }
    let placement = {
        let mut core = core_ref.get_mut();
        let workers = core.get_workers();
        if workers.is_empty() {
            return Err(TgError::NoCapacity(
                "no workers registered for scatter".into(),
            ));
        }
        let counter = core.get_and_move_scatter_counter(cache.len());
        scatter_placement(cache, &workers, counter)
    };

    let (queue_id, mut rx) = core_ref.get_mut().replies.open();
    let result = scatter_exchange(core_ref, run, placement, queue_id, &mut rx).await;
    core_ref.get_mut().replies.close(queue_id);
    result
}

async fn scatter_exchange(
    core_ref: &CoreRef,
    run: &mut RunState,
    placement: Vec<(WorkerRef, Vec<(TaskKey, Payload)>)>,
    queue_id: RequestId,
    rx: &mut UnboundedReceiver<ReplyEvent>,
) -> crate::Result<()> {
    let mut expected = 0;
    for (worker_ref, items) in placement {
        let mut builder = MessageBuilder::new();
        for (key, value) in items {
            expected += 1;
            let value = value.to_transport(&mut builder);
            builder.add_message(ToWorkerMessage::SetItem(SetItemMsg {
                key,
                value,
                queue: queue_id,
            }));
        }
        worker_ref.get().send_packet(builder.build_batch()?);
    }

    let mut placed = 0;
    while placed < expected {
        match rx.recv().await {
            Some(ReplyEvent::ScatterPlaced {
                key,
                worker,
                nbytes,
            }) => {
                placed += 1;
                match run.tasks.get(&key).cloned() {
                    Some(task_ref) => settle_resident(core_ref, run, &task_ref, worker, nbytes),
                    None => log::debug!("Scatter ack for unknown key {}", key),
                }
            }
            Some(ReplyEvent::WorkerLost { worker }) => {
                return Err(TgError::GenericError(format!(
                    "worker {} lost while scattering data",
                    worker
                )));
            }
            Some(other) => log::debug!("Ignoring unexpected reply during scatter: {:?}", other),
            None => return Err(TgError::GenericError("reply queue closed".into())),
        }
    }
    Ok(())
}

/// Spreads values over workers proportionally to their declared core
/// count, continuing the rotation where the previous scatter left off.
fn scatter_placement(
    data: Vec<(TaskKey, Payload)>,
    workers: &[WorkerRef],
    counter: usize,
) -> Vec<(WorkerRef, Vec<(TaskKey, Payload)>)> {
    let total_cpus: usize = workers
        .iter()
        .map(|wr| wr.get().ncpus.max(1) as usize)
        .sum();
    let mut counter = counter % total_cpus;

    let mut cpu = 0;
    let mut index = 0;
    for (i, wr) in workers.iter().enumerate() {
        let ncpus = wr.get().ncpus.max(1) as usize;
        if counter >= ncpus {
            counter -= ncpus;
        } else {
            cpu = counter;
            index = i;
            break;
        }
    }

    let mut ncpus = workers[index].get().ncpus.max(1) as usize;
    let mut result: Map<WorkerRef, Vec<(TaskKey, Payload)>> = Map::new();
    for (key, value) in data {
        result
            .entry(workers[index].clone())
            .or_default()
            .push((key, value));
        cpu += 1;
        if cpu >= ncpus {
            cpu = 0;
            index = (index + 1) % workers.len();
            ncpus = workers[index].get().ncpus.max(1) as usize;
        }
    }
    result.into_iter().collect()
}

/// The fire and event loops: dispatch whatever is ready onto whatever is
/// free, then block for the next completion or failure reply.
async fn drive(core_ref: &CoreRef, run: &mut RunState) -> crate::Result<()> {
    if run.pending == 0 {
        return Ok(());
    }
    let (queue_id, mut rx) = core_ref.get_mut().replies.open();
    let result = drive_inner(core_ref, run, queue_id, &mut rx).await;
    core_ref.get_mut().replies.close(queue_id);
    result
}

async fn drive_inner(
    core_ref: &CoreRef,
    run: &mut RunState,
    queue_id: RequestId,
    rx: &mut UnboundedReceiver<ReplyEvent>,
) -> crate::Result<()> {
    while run.pending > 0 {
        fire_ready(core_ref, run, queue_id)?;
        let event = rx
            .recv()
            .await
            .ok_or_else(|| TgError::GenericError("reply queue closed".into()))?;
        match event {
            ReplyEvent::Finished {
                key,
                worker,
                nbytes,
                duration,
            } => {
                let task_ref = match run.tasks.get(&key).cloned() {
                    Some(task_ref) => task_ref,
                    None => {
                        log::debug!("Completion for unknown task {}", key);
                        continue;
                    }
                };
                if !task_ref.get().is_running() {
                    log::debug!("Duplicate completion for task {}", key);
                    continue;
                }
                log::debug!(
                    "Task {} finished on worker {} in {:.6}s",
                    key,
                    worker,
                    duration
                );
                run.pending -= 1;
                settle_resident(core_ref, run, &task_ref, worker, nbytes);
            }
            ReplyEvent::Failed {
                key,
                exception,
                traceback,
            } => {
                log::debug!("Task {} failed on worker, aborting submission", key);
                return Err(TgError::TaskFailed(TaskFailure {
                    key,
                    exception,
                    traceback,
                }));
            }
            ReplyEvent::WorkerLost { worker } => {
                if run.tasks.values().any(|t| t.get().is_running_on(worker)) {
                    return Err(TgError::GenericError(format!(
                        "worker {} lost while executing tasks",
                        worker
                    )));
                }
                if !core_ref.get().has_workers() {
                    return Err(TgError::NoCapacity(
                        "all workers departed during execution".into(),
                    ));
                }
            }
            other => log::debug!("Ignoring unexpected reply: {:?}", other),
        }
    }
    Ok(())
}

fn fire_ready(core_ref: &CoreRef, run: &mut RunState, queue_id: RequestId) -> crate::Result<()> {
    while !run.ready.is_empty() {
        let worker_ref = match take_live_worker(core_ref) {
            Some(worker_ref) => worker_ref,
            None => return Ok(()),
        };
        let task_ref = run.ready.pop().ensure();
        dispatch_task(core_ref, &task_ref, &worker_ref, queue_id)?;
    }
    Ok(())
}

fn take_live_worker(core_ref: &CoreRef) -> Option<WorkerRef> {
    let core = core_ref.get();
    loop {
        let id = core.pool.try_take_available()?;
        match core.get_worker_by_id(id) {
            Some(worker_ref) => return Some(worker_ref.clone()),
            None => log::debug!("Dropping availability entry of departed worker {}", id),
        }
    }
}

fn dispatch_task(
    core_ref: &CoreRef,
    task_ref: &TaskRef,
    worker_ref: &WorkerRef,
    queue_id: RequestId,
) -> crate::Result<()> {
    let worker_id = worker_ref.get().id;
    let packet = {
        let core = core_ref.get();
        let task = task_ref.get();
        let spec = task
            .spec
            .as_ref()
            .ok_or_else(|| TgError::GenericError(format!("task {} has no invocation", task.key)))?;

        let mut locations: Vec<(TaskKey, Vec<TaskKey>)> =
            Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            let addresses: Vec<TaskKey> = core
                .locations
                .holders(dep)
                .map(|holders| {
                    holders
                        .iter()
                        .filter_map(|id| {
                            core.get_worker_by_id(*id)
                                .map(|w| w.get().listen_address.clone())
                        })
                        .collect()
                })
                .unwrap_or_default();
            if addresses.is_empty() {
                return Err(TgError::GenericError(format!(
                    "no live replica of {} needed by task {}",
                    dep, task.key
                )));
            }
            locations.push((dep.clone(), addresses));
        }

        let mut builder = MessageBuilder::new();
        let function = spec.function.to_transport(&mut builder);
        let args = spec.args.iter().map(|a| a.to_transport(&mut builder)).collect();
        builder.add_message(ToWorkerMessage::Compute(ComputeMsg {
            key: task.key.clone(),
            function,
            args,
            locations,
            queue: queue_id,
        }));
        builder.build_single()?
    };
    task_ref.get_mut().state = TaskRunState::Running(worker_id);
    log::debug!(
        "Task {} dispatched to worker {}",
        task_ref.get().key,
        worker_id
    );
    worker_ref.get().send_packet(packet);
    Ok(())
}

/// Marks a key's data as resident on `worker` and propagates readiness:
/// consumers lose an unfinished input, drained dependencies and dead
/// ends get their data evicted.
fn settle_resident(
    core_ref: &CoreRef,
    run: &mut RunState,
    task_ref: &TaskRef,
    worker: WorkerId,
    nbytes: u64,
) {
    {
        let mut task = task_ref.get_mut();
        if task.is_finished() {
            log::debug!("Key {} is already resident", task.key);
            return;
        }
        task.state = TaskRunState::Finished(DataInfo { size: nbytes });
    }
    core_ref
        .get_mut()
        .locations
        .record(task_ref.get().key.clone(), worker);

    let consumers: Vec<TaskRef> = task_ref.get().get_consumers().iter().cloned().collect();
    for consumer in consumers {
        let became_ready = {
            let mut task = consumer.get_mut();
            task.unfinished_inputs -= 1;
            if task.unfinished_inputs == 0 && task.is_waiting() {
                task.state = TaskRunState::Ready;
                true
            } else {
                false
            }
        };
        if became_ready {
            run.ready.push(consumer);
        }
    }

    let dependencies = task_ref.get().dependencies.clone();
    for dep in dependencies {
        if let Some(dep_ref) = run.tasks.get(&dep).cloned() {
            dep_ref.get_mut().remove_consumer(task_ref);
            maybe_release(core_ref, &dep_ref, &run.result_keys);
        }
    }
    maybe_release(core_ref, task_ref, &run.result_keys);
}

/// Evicts a key once nothing waits for it anymore, unless the client
/// asked for it.
fn maybe_release(core_ref: &CoreRef, task_ref: &TaskRef, result_keys: &Set<TaskKey>) {
    let release = {
        let task = task_ref.get();
        task.is_finished() && !task.has_consumers() && !result_keys.contains(&task.key)
    };
    if release {
        release_key(core_ref, &task_ref.get().key);
        task_ref.get_mut().state = TaskRunState::Released;
    }
}

/// Fire-and-forget eviction: tells every holder to drop the key and
/// removes the location entries locally. No acknowledgment is awaited.
fn release_key(core_ref: &CoreRef, key: &TaskKey) {
    let mut core = core_ref.get_mut();
    let holders = core.locations.release(key);
    for worker_id in holders {
        if let Some(worker_ref) = core.get_worker_by_id(worker_id) {
            worker_ref
                .get()
                .send_message(ToWorkerMessage::DelItem(DelItemMsg { key: key.clone() }))
                .unwrap_or_else(|e| log::error!("Sending eviction of {} failed: {}", key, e));
        }
    }
}

/// Fetches every result key from one randomly chosen holder.
async fn gather(core_ref: &CoreRef, run: &RunState) -> crate::Result<Map<TaskKey, Payload>> {
    if run.result_keys.is_empty() {
        return Ok(Map::new());
    }
    let plan: Vec<(WorkerRef, Vec<TaskKey>)> = {
        let core = core_ref.get();
        let mut rng = rand::thread_rng();
        let mut per_worker: Map<WorkerId, Vec<TaskKey>> = Map::new();
        for key in &run.result_keys {
            let holders = core
                .locations
                .holders(key)
                .filter(|ws| !ws.is_empty())
                .ok_or_else(|| {
                    TgError::GenericError(format!("no live replica of result key {}", key))
                })?;
            let ids: Vec<_> = holders.iter().copied().collect();
            let chosen = *ids.choose(&mut rng).ensure();
            per_worker.entry(chosen).or_default().push(key.clone());
        }
        let mut plan = Vec::with_capacity(per_worker.len());
        for (worker_id, keys) in per_worker {
            let worker_ref = core
                .get_worker_by_id(worker_id)
                .ok_or_else(|| {
                    TgError::GenericError(format!("worker {} departed before gather", worker_id))
                })?
                .clone();
            plan.push((worker_ref, keys));
        }
        plan
    };

    let (queue_id, mut rx) = core_ref.get_mut().replies.open();
    let result = gather_exchange(plan, queue_id, &mut rx).await;
    core_ref.get_mut().replies.close(queue_id);
    result
}

async fn gather_exchange(
    plan: Vec<(WorkerRef, Vec<TaskKey>)>,
    queue_id: RequestId,
    rx: &mut UnboundedReceiver<ReplyEvent>,
) -> crate::Result<Map<TaskKey, Payload>> {
    let mut expected = 0;
    for (worker_ref, keys) in plan {
        let mut builder = MessageBuilder::new();
        for key in keys {
            expected += 1;
            builder.add_message(ToWorkerMessage::GetItem(GetItemMsg {
                key,
                queue: queue_id,
            }));
        }
        worker_ref.get().send_packet(builder.build_batch()?);
    }

    let mut values = Map::with_capacity(expected);
    while values.len() < expected {
        match rx.recv().await {
            Some(ReplyEvent::Value { key, value }) => {
                values.insert(key, value);
            }
            Some(ReplyEvent::WorkerLost { worker }) => {
                return Err(TgError::GenericError(format!(
                    "worker {} lost while gathering results",
                    worker
                )));
            }
            Some(other) => log::debug!("Ignoring unexpected reply during gather: {:?}", other),
            None => return Err(TgError::GenericError("reply queue closed".into())),
        }
    }
    Ok(values)
}

/// Evicts everything this submission materialized, result keys
/// included; the results were already copied out by `gather`. Data that
/// was resident before the submission stays untouched.
fn release_run_data(core_ref: &CoreRef, run: &RunState) {
    for task_ref in run.tasks.values() {
        if task_ref.get().is_finished() {
            release_key(core_ref, &task_ref.get().key);
            task_ref.get_mut().state = TaskRunState::Released;
        }
    }
}

pub fn schedule_ack_packet(outcome: ScheduleOutcome) -> crate::Result<Packet> {
    let mut builder = MessageBuilder::new();
    let result = shape_results(&outcome.keys, &outcome.values, &mut builder)?;
    builder.add_message(ToClientMessage::ScheduleAck(ScheduleAckMsg {
        keys: outcome.keys,
        result,
    }));
    builder.build_single()
}

pub fn schedule_error_packet(error: TgError) -> crate::Result<Packet> {
    let mut builder = MessageBuilder::new();
    let msg = match error {
        TgError::TaskFailed(failure) => ScheduleErrorMsg {
            error: format!("task {} failed on worker", failure.key),
            key: Some(failure.key),
            exception: Some(failure.exception.to_transport(&mut builder)),
            traceback: failure.traceback.map(|t| t.to_transport(&mut builder)),
        },
        other => ScheduleErrorMsg {
            key: None,
            error: other.to_string(),
            exception: None,
            traceback: None,
        },
    };
    builder.add_message(ToClientMessage::ScheduleError(msg));
    builder.build_single()
}

/// Arranges the gathered values in the exact nesting of the requested
/// keys.
fn shape_results(
    selection: &KeySelection,
    values: &Map<TaskKey, Payload>,
    builder: &mut MessageBuilder<ToClientMessage>,
) -> crate::Result<ResultTree> {
    Ok(match selection {
        KeySelection::Key(key) => {
            let value = values.get(key).ok_or_else(|| {
                TgError::GenericError(format!("result value for key {} is missing", key))
            })?;
            ResultTree::Value(value.to_transport(builder))
        }
        KeySelection::List(items) => ResultTree::List(
            items
                .iter()
                .map(|item| shape_results(item, values, builder))
                .collect::<crate::Result<_>>()?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::protocol::clientmsg::{
        KeySelection, ResultTree, ScheduleMsg, TaskSpec, ToClientMessage,
    };
    use crate::protocol::codec::{deserialize_packet, Batch, Payload, PayloadTransport};
    use crate::protocol::key::{to_key, TaskKey};
    use crate::server::core::CoreRef;
    use crate::test_util::{
        emulate_worker, event_log, inline, invocation, key_arg, literal, register_test_worker,
        value_arg, EventLog,
    };
    use crate::TgError;

    use super::{schedule, schedule_ack_packet, ScheduleOutcome};

    fn graph(entries: Vec<(&str, TaskSpec<Payload>)>, keys: KeySelection) -> ScheduleMsg<Payload> {
        ScheduleMsg {
            graph: entries
                .into_iter()
                .map(|(key, spec)| (to_key(key), spec))
                .collect(),
            keys,
        }
    }

    fn single(key: &str) -> KeySelection {
        KeySelection::Key(to_key(key))
    }

    async fn run_with_worker(
        core_ref: &CoreRef,
        msg: ScheduleMsg<Payload>,
        events: &EventLog,
        preload: Vec<(TaskKey, rmpv::Value)>,
    ) -> crate::Result<ScheduleOutcome> {
        let (worker_ref, rx) = register_test_worker(core_ref, "tcp://w1:1", 1);
        tokio::select! {
            result = schedule(core_ref, msg) => result,
            _ = emulate_worker(core_ref.clone(), worker_ref, rx, events.clone(), preload) => {
                panic!("Test worker stopped")
            }
        }
    }

    fn count_events(events: &EventLog, needle: &str) -> usize {
        events.get().iter().filter(|e| e.as_str() == needle).count()
    }

    fn event_position(events: &EventLog, needle: &str) -> usize {
        events
            .get()
            .iter()
            .position(|e| e.as_str() == needle)
            .unwrap_or_else(|| panic!("Event {} not recorded", needle))
    }

    #[tokio::test]
    async fn round_trip() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let msg = graph(
            vec![
                ("x", literal(1)),
                ("y", invocation("add", vec![key_arg("x"), value_arg(2)])),
            ],
            single("y"),
        );
        let outcome = run_with_worker(&core_ref, msg, &events, vec![])
            .await
            .unwrap();
        assert_eq!(outcome.values[&to_key("y")], inline(3i64));
        assert_eq!(count_events(&events, "compute y"), 1);
    }

    #[tokio::test]
    async fn nested_result_shape() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let keys = KeySelection::List(vec![
            KeySelection::List(vec![single("c")]),
            KeySelection::List(vec![single("a")]),
        ]);
        let msg = graph(
            vec![
                ("a", literal(1)),
                ("b", literal(2)),
                ("c", invocation("add", vec![key_arg("a"), key_arg("b")])),
            ],
            keys,
        );
        let outcome = run_with_worker(&core_ref, msg, &events, vec![])
            .await
            .unwrap();

        let packet = schedule_ack_packet(outcome).unwrap();
        let batch: Batch<ToClientMessage> = deserialize_packet(packet).unwrap();
        match &batch[0] {
            ToClientMessage::ScheduleAck(ack) => {
                let expected = ResultTree::List(vec![
                    ResultTree::List(vec![ResultTree::Value(PayloadTransport::Inline(
                        rmpv::Value::from(3i64),
                    ))]),
                    ResultTree::List(vec![ResultTree::Value(PayloadTransport::Inline(
                        rmpv::Value::from(1i64),
                    ))]),
                ]);
                assert_eq!(ack.result, expected);
            }
            other => panic!("Expected an ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failure_propagates_exact_exception() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let msg = graph(vec![("y", invocation("boom", vec![]))], single("y"));
        let error = run_with_worker(&core_ref, msg, &events, vec![])
            .await
            .unwrap_err();
        match error {
            TgError::TaskFailed(failure) => {
                assert_eq!(failure.key, to_key("y"));
                assert_eq!(failure.exception, inline("ValueError('boom')"));
                assert!(failure.traceback.is_none());
            }
            other => panic!("Expected a task failure, got {}", other),
        }
    }

    #[tokio::test]
    async fn no_worker_times_out() {
        let core_ref = CoreRef::with_worker_wait(Duration::from_millis(50));
        let msg = graph(
            vec![
                ("x", literal(1)),
                ("y", invocation("add", vec![key_arg("x"), value_arg(2)])),
            ],
            single("y"),
        );
        let started = Instant::now();
        let error = schedule(&core_ref, msg).await.unwrap_err();
        assert!(matches!(error, TgError::NoCapacity(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cyclic_graph_fails_fast() {
        let core_ref = CoreRef::default();
        let msg = graph(
            vec![
                ("y", invocation("add", vec![key_arg("z")])),
                ("z", invocation("add", vec![key_arg("y")])),
            ],
            single("y"),
        );
        // fails before the worker wait kicks in
        let error = schedule(&core_ref, msg).await.unwrap_err();
        assert!(matches!(error, TgError::MalformedGraph(_)));
    }

    #[tokio::test]
    async fn self_dependency_fails_fast() {
        let core_ref = CoreRef::default();
        let msg = graph(
            vec![("y", invocation("add", vec![key_arg("y")]))],
            single("y"),
        );
        let error = schedule(&core_ref, msg).await.unwrap_err();
        assert!(matches!(error, TgError::MalformedGraph(_)));
    }

    #[tokio::test]
    async fn unknown_result_key_fails_fast() {
        let core_ref = CoreRef::default();
        let msg = graph(vec![("x", literal(1))], single("q"));
        let error = schedule(&core_ref, msg).await.unwrap_err();
        assert!(matches!(error, TgError::MalformedGraph(_)));
    }

    #[tokio::test]
    async fn diamond_dispatches_each_task_once() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let msg = graph(
            vec![
                ("a", literal(1)),
                ("b", invocation("add", vec![key_arg("a"), value_arg(1)])),
                ("c", invocation("add", vec![key_arg("a"), value_arg(2)])),
                ("d", invocation("add", vec![key_arg("b"), key_arg("c")])),
            ],
            single("d"),
        );
        let outcome = run_with_worker(&core_ref, msg, &events, vec![])
            .await
            .unwrap();
        assert_eq!(outcome.values[&to_key("d")], inline(5i64));
        for key in ["b", "c", "d"] {
            assert_eq!(count_events(&events, &format!("compute {}", key)), 1);
        }
    }

    #[tokio::test]
    async fn release_happens_after_consumers_and_gather() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let msg = graph(
            vec![
                ("x", literal(1)),
                ("y", invocation("add", vec![key_arg("x"), value_arg(1)])),
                ("z", invocation("add", vec![key_arg("y"), value_arg(1)])),
            ],
            single("z"),
        );
        let outcome = run_with_worker(&core_ref, msg, &events, vec![])
            .await
            .unwrap();
        assert_eq!(outcome.values[&to_key("z")], inline(3i64));

        // a dependency is evicted only once its last consumer ran
        assert!(event_position(&events, "delitem x") > event_position(&events, "compute y"));
        assert!(event_position(&events, "delitem y") > event_position(&events, "compute z"));
        // the result key survives until it was gathered
        assert!(event_position(&events, "delitem z") > event_position(&events, "getitem z"));
        // nothing from this submission stays resident
        assert!(!core_ref.get().locations.is_resident(&to_key("x")));
        assert!(!core_ref.get().locations.is_resident(&to_key("z")));
    }

    #[tokio::test]
    async fn resident_data_feeds_new_submission() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let (worker_ref, rx) = register_test_worker(&core_ref, "tcp://w1:1", 1);
        let worker_id = worker_ref.get().id;
        core_ref.get_mut().locations.record(to_key("ext"), worker_id);

        let msg = graph(
            vec![("y", invocation("add", vec![key_arg("ext"), value_arg(1)]))],
            single("y"),
        );
        let preload = vec![(to_key("ext"), rmpv::Value::from(10i64))];
        let outcome = tokio::select! {
            result = schedule(&core_ref, msg) => result.unwrap(),
            _ = emulate_worker(core_ref.clone(), worker_ref, rx, events.clone(), preload) => {
                panic!("Test worker stopped")
            }
        };
        assert_eq!(outcome.values[&to_key("y")], inline(11i64));
        // data owned by earlier submissions is not evicted
        assert!(core_ref.get().locations.is_resident(&to_key("ext")));
        assert_eq!(count_events(&events, "delitem ext"), 0);
    }

    #[tokio::test]
    async fn worker_loss_fails_submission() {
        let core_ref = CoreRef::default();
        let events = event_log();
        let msg = graph(vec![("y", invocation("die", vec![]))], single("y"));
        let error = run_with_worker(&core_ref, msg, &events, vec![])
            .await
            .unwrap_err();
        assert!(error.to_string().contains("lost"));
    }
}
