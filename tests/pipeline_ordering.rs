//! Frame ordering through a running pipeline, observed at the task boundary.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use voxagent::frame::CancelReason;
use voxagent::pipeline::TASK_ENDPOINT;
use voxagent::{
    Direction, Frame, FrameData, FrameKind, FramePushed, Observer, Pipeline, PipelineTask, Stage,
    StageContext, StageError, TaskOutcome, TaskParams,
};

/// Records every frame that leaves the chain.
#[derive(Clone, Default)]
struct Boundary {
    frames: Arc<Mutex<Vec<(Direction, FrameData)>>>,
}

impl Boundary {
    fn downstream_texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(direction, data)| match (direction, data) {
                (Direction::Downstream, FrameData::LlmText(text)) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn kinds(&self, wanted: Direction) -> Vec<FrameKind> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(direction, _)| *direction == wanted)
            .map(|(_, data)| data.kind())
            .collect()
    }
}

impl Observer for Boundary {
    fn on_push(&self, event: &FramePushed) {
        if &*event.destination == TASK_ENDPOINT {
            self.frames
                .lock()
                .unwrap()
                .push((event.direction, event.frame.data().clone()));
        }
    }
}

struct Passthrough(&'static str);

#[async_trait]
impl Stage for Passthrough {
    fn name(&self) -> &str {
        self.0
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        ctx.forward(frame, direction);
        Ok(())
    }
}

/// Turns every `TtsSpeak(text)` into `text/a`, `text/b`.
struct Splitter;

#[async_trait]
impl Stage for Splitter {
    fn name(&self) -> &str {
        "Splitter"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        match frame.data() {
            FrameData::TtsSpeak(text) => {
                ctx.push_downstream(FrameData::LlmText(format!("{text}/a")));
                tokio::task::yield_now().await;
                ctx.push_downstream(FrameData::LlmText(format!("{text}/b")));
            }
            _ => ctx.forward(frame, direction),
        }
        Ok(())
    }
}

/// Answers every `LlmText` with an upstream `RunSignal`.
struct Echo;

#[async_trait]
impl Stage for Echo {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        if direction == Direction::Downstream && frame.kind() == FrameKind::LlmText {
            ctx.push_upstream(FrameData::RunSignal);
        }
        ctx.forward(frame, direction);
        Ok(())
    }
}

/// Takes a while over every data frame.
struct Slow;

#[async_trait]
impl Stage for Slow {
    fn name(&self) -> &str {
        "Slow"
    }

    async fn process(
        &mut self,
        frame: Frame,
        direction: Direction,
        ctx: &StageContext,
    ) -> Result<(), StageError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.forward(frame, direction);
        Ok(())
    }
}

fn params() -> TaskParams {
    TaskParams {
        idle_timeout: None,
        ..TaskParams::default()
    }
}

fn task(stages: Vec<Box<dyn Stage>>, boundary: &Boundary) -> PipelineTask {
    let pipeline = Pipeline::new(stages).unwrap();
    PipelineTask::new(pipeline, params(), vec![Arc::new(boundary.clone())])
}

#[tokio::test]
async fn test_emission_order_survives_every_hop() {
    let boundary = Boundary::default();
    let task = task(
        vec![
            Box::new(Passthrough("First")),
            Box::new(Splitter),
            Box::new(Passthrough("Middle")),
            Box::new(Passthrough("Last")),
        ],
        &boundary,
    );
    let handle = task.handle();

    let frames: Vec<FrameData> = (0..50).map(|i| FrameData::TtsSpeak(i.to_string())).collect();
    handle.queue_frames(frames).unwrap();
    handle.stop_when_done().unwrap();

    assert_eq!(task.run().await, TaskOutcome::Completed);

    let expected: Vec<String> = (0..50)
        .flat_map(|i| [format!("{i}/a"), format!("{i}/b")])
        .collect();
    assert_eq!(boundary.downstream_texts(), expected);

    let kinds = boundary.kinds(Direction::Downstream);
    assert_eq!(kinds.first(), Some(&FrameKind::Start));
    assert_eq!(kinds.last(), Some(&FrameKind::End));
}

#[tokio::test]
async fn test_upstream_frames_leave_at_the_head() {
    let boundary = Boundary::default();
    let task = task(
        vec![
            Box::new(Passthrough("Input")),
            Box::new(Splitter),
            Box::new(Echo),
        ],
        &boundary,
    );
    let handle = task.handle();
    let run = tokio::spawn(task.run());

    handle.queue_frame(FrameData::TtsSpeak("x".into())).unwrap();
    for _ in 0..200 {
        if boundary.kinds(Direction::Upstream).len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();
    assert_eq!(
        run.await.unwrap(),
        TaskOutcome::Cancelled(CancelReason::Requested)
    );

    let upstream = boundary.kinds(Direction::Upstream);
    assert_eq!(upstream, vec![FrameKind::RunSignal, FrameKind::RunSignal]);
}

#[tokio::test]
async fn test_cancel_overtakes_queued_data() {
    let boundary = Boundary::default();
    let task = task(vec![Box::new(Slow), Box::new(Passthrough("Out"))], &boundary);
    let handle = task.handle();

    let frames: Vec<FrameData> = (0..100).map(|i| FrameData::TtsSpeak(i.to_string())).collect();
    handle.queue_frames(frames).unwrap();

    let started = Instant::now();
    let run = tokio::spawn(task.run());
    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.cancel();

    let outcome = run.await.unwrap();
    assert_eq!(outcome, TaskOutcome::Cancelled(CancelReason::Requested));
    // 100 frames at 50ms each would take five seconds
    assert!(started.elapsed() < Duration::from_secs(2));

    let passed = boundary
        .kinds(Direction::Downstream)
        .iter()
        .filter(|k| **k == FrameKind::TtsSpeak)
        .count();
    assert!(passed < 100, "cancel waited for {passed} queued frames");
}
