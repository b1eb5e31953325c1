//! Post-processing worker behaviour seen from outside the crate

use nenn::worker::protocol::{Envelope, LoadModels, Request, RunPostProcess};
use nenn::{
    AlphaMatte, Background, Compositor, InitOptions, NennError, OutputFormat,
    PostProcessWorkerManager, PostProcessor, Result,
};
use nenn::worker::FrameData;
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn frame(value: u8) -> RunPostProcess {
    RunPostProcess {
        frame: FrameData {
            width: 2,
            height: 1,
            channels: 3,
            pixels: vec![value; 6],
        },
        alpha: AlphaMatte::new(2, 1, vec![1.0, 0.5]).unwrap(),
    }
}

/// Holds every frame until the test releases it
struct Gate {
    release: mpsc::Receiver<()>,
}

impl PostProcessor for Gate {
    fn init(&mut self, _options: InitOptions) -> Result<()> {
        Ok(())
    }

    fn load_models(&mut self, _request: LoadModels) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, task: RunPostProcess) -> Result<FrameData> {
        self.release
            .recv()
            .map_err(|_| NennError::worker("gate closed"))?;
        Ok(task.frame)
    }
}

#[tokio::test]
async fn test_compositor_rgba_output() {
    let manager = PostProcessWorkerManager::spawn(Compositor::new(), 2).unwrap();
    manager
        .init(InitOptions {
            output: OutputFormat::Rgba,
            ..InitOptions::default()
        })
        .await
        .unwrap();

    let result = manager.run(frame(40)).await.unwrap();
    assert_eq!(result.channels, 4);
    assert_eq!(result.pixels, vec![40, 40, 40, 255, 40, 40, 40, 128]);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_errors_are_scoped_to_their_request() {
    let manager = PostProcessWorkerManager::spawn(Compositor::new(), 2).unwrap();

    // Frames before init are rejected, but the worker keeps serving
    assert!(matches!(manager.run(frame(1)).await, Err(NennError::Worker(_))));

    let missing = LoadModels {
        paths: vec!["/nonexistent/model.onnx".into()],
    };
    assert!(matches!(
        manager.load_models(missing).await,
        Err(NennError::Worker(_))
    ));

    manager
        .init(InitOptions {
            background: Background::Color([0, 0, 0]),
            ..InitOptions::default()
        })
        .await
        .unwrap();
    let result = manager.run(frame(200)).await.unwrap();
    assert_eq!(result.channels, 3);
    assert_eq!(&result.pixels[..3], &[200, 200, 200]);
    assert_eq!(&result.pixels[3..], &[100, 100, 100]);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_matte_gets_an_error_reply() {
    let manager = PostProcessWorkerManager::spawn(Compositor::new(), 2).unwrap();
    manager.init(InitOptions::default()).await.unwrap();

    let mut task = frame(50);
    task.alpha = AlphaMatte {
        width: 2,
        height: 1,
        values: vec![1.0],
    };
    let result = manager.run(task).await;
    assert!(matches!(result, Err(NennError::Worker(ref m)) if m.contains("Alpha matte")));

    // Later frames are unaffected
    assert_eq!(manager.run(frame(50)).await.unwrap().pixels.len(), 6);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_limit_holds_back_requests() {
    let (release, gate) = mpsc::channel();
    let manager = Arc::new(PostProcessWorkerManager::spawn(Gate { release: gate }, 1).unwrap());
    assert_eq!(manager.max_queue_size(), 1);

    let first = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.run(frame(1)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.run(frame(2)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The second frame waits for a free slot instead of queueing
    assert_eq!(manager.pending(), 1);
    assert!(!second.is_finished());

    release.send(()).unwrap();
    release.send(()).unwrap();
    assert_eq!(first.await.unwrap().unwrap().pixels, vec![1; 6]);
    assert_eq!(second.await.unwrap().unwrap().pixels, vec![2; 6]);
    assert_eq!(manager.pending(), 0);
}

#[test]
fn test_wire_format() {
    let envelope = Envelope {
        id: 7,
        message: Request::LoadModels(LoadModels {
            paths: vec!["a.onnx".into()],
        }),
    };
    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["id"], 7);
    assert_eq!(value["message"]["type"], "LOAD_MODELS");
    assert_eq!(value["message"]["data"]["paths"][0], "a.onnx");

    let decoded: Envelope<Request> = serde_json::from_value(value).unwrap();
    assert_eq!(decoded, envelope);
}
