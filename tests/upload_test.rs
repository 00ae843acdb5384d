use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatstream::backend::{ApiCall, ChannelTransport, MemoryChatApi};
use chatstream::controller::{ChatConfig, ChatController, TurnOutcome};
use chatstream::message::MessagePart;
use chatstream::upload::{LocalFile, MemoryPreviews, UploadStatus, UploadedFile, Uploader};
use tokio::sync::{Mutex, Semaphore};

/// Uploads succeed unless the file name starts with "bad"; each upload takes a permit.
struct GatedUploader {
    gate: Semaphore,
    terminated: Mutex<Vec<String>>,
}

impl GatedUploader {
    fn open() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            gate: Semaphore::new(permits),
            terminated: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Uploader for GatedUploader {
    async fn upload(&self, file: &LocalFile) -> anyhow::Result<UploadedFile> {
        self.gate.acquire().await?.forget();
        if file.name.starts_with("bad") {
            anyhow::bail!("Upload failed with status: 413");
        }
        Ok(UploadedFile {
            id: format!("up-{}", file.name),
            url: format!("http://api/files/thumbnail/up-{}", file.name),
        })
    }

    async fn terminate(&self, file: &LocalFile) -> anyhow::Result<()> {
        self.terminated.lock().await.push(file.name.clone());
        Ok(())
    }
}

struct Harness {
    controller: Arc<ChatController>,
    api: Arc<MemoryChatApi>,
    uploader: Arc<GatedUploader>,
    previews: Arc<MemoryPreviews>,
}

fn harness(uploader: GatedUploader) -> Harness {
    let api = Arc::new(MemoryChatApi::new());
    let uploader = Arc::new(uploader);
    let previews = Arc::new(MemoryPreviews::new());
    let mut config = ChatConfig::new("http://api");
    config.params.streaming = false;
    let controller = ChatController::new(config, api.clone(), Arc::new(ChannelTransport::new()))
        .with_uploader(uploader.clone(), previews.clone());
    Harness {
        controller: Arc::new(controller),
        api,
        uploader,
        previews,
    }
}

fn text_file(name: &str) -> LocalFile {
    LocalFile::new(name, "text/plain", name.as_bytes().to_vec())
}

async fn sent_file_ids(api: &MemoryChatApi) -> Option<Vec<String>> {
    api.calls().await.into_iter().find_map(|c| match c {
        ApiCall::CreateChat(request) => Some(request.message.file_ids),
        _ => None,
    })
}

#[tokio::test]
async fn test_failed_upload_does_not_block_others() {
    let h = harness(GatedUploader::open());

    let ids = h
        .controller
        .add_files(vec![text_file("good.txt"), text_file("bad.txt")])
        .await;

    assert_eq!(ids.len(), 2);
    let files = h.controller.files().await;
    assert_eq!(files[0].status, UploadStatus::Uploaded);
    assert_eq!(files[1].status, UploadStatus::Error);
    assert_eq!(
        files[1].error.as_deref(),
        Some("Upload failed with status: 413")
    );
    assert!(!h.controller.is_uploading().await);
    assert_eq!(h.previews.live(), 2);

    h.controller.set_prompt("what is in this file?").await;
    let outcome = h.controller.send().await.unwrap();

    assert!(matches!(outcome, TurnOutcome::Completed(_)));
    assert_eq!(
        sent_file_ids(&h.api).await,
        Some(vec!["up-good.txt".to_string()])
    );
    assert!(h.controller.files().await.is_empty());
    assert_eq!(h.previews.live(), 0);

    let user = h.controller.user_message("chat-1").await.unwrap();
    let urls = user
        .files()
        .filter_map(|part| match part {
            MessagePart::File { url, .. } => Some(url.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(urls, vec!["http://api/files/thumbnail/up-good.txt".to_string()]);
}

#[tokio::test]
async fn test_remove_and_clear_release_previews() {
    let h = harness(GatedUploader::open());
    let ids = h
        .controller
        .add_files(vec![text_file("a.txt"), text_file("b.txt"), text_file("c.txt")])
        .await;
    assert_eq!(h.previews.live(), 3);

    assert!(h.controller.remove_file(&ids[1]).await);
    assert!(!h.controller.remove_file(&ids[1]).await);
    assert_eq!(h.previews.live(), 2);
    assert_eq!(h.controller.files().await.len(), 2);
    assert!(h.uploader.terminated.lock().await.is_empty());

    h.controller.clear_files().await;
    assert_eq!(h.previews.live(), 0);
    assert!(h.controller.files().await.is_empty());
}

#[tokio::test]
async fn test_removing_in_flight_upload_terminates_it() {
    let h = harness(GatedUploader::with_permits(0));
    let task = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.add_files(vec![text_file("big.pdf")]).await })
    };
    let mut changes = h.controller.subscribe();
    while !h.controller.is_uploading().await {
        changes.changed().await.unwrap();
    }
    let id = h.controller.files().await[0].id.clone();

    assert!(h.controller.remove_file(&id).await);
    assert_eq!(*h.uploader.terminated.lock().await, vec!["big.pdf".to_string()]);
    assert_eq!(h.previews.live(), 0);

    h.uploader.gate.add_permits(1);
    task.await.unwrap();
    assert!(h.controller.files().await.is_empty());
}

#[tokio::test]
async fn test_send_waits_for_uploads() {
    let h = harness(GatedUploader::with_permits(0));
    let upload = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.add_files(vec![text_file("report.pdf")]).await })
    };
    let mut changes = h.controller.subscribe();
    while !h.controller.is_uploading().await {
        changes.changed().await.unwrap();
    }

    h.controller.set_prompt("summarize").await;
    let send = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.send().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sent_file_ids(&h.api).await, None);

    h.uploader.gate.add_permits(1);
    upload.await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), send)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Completed(_)));
    assert_eq!(
        sent_file_ids(&h.api).await,
        Some(vec!["up-report.pdf".to_string()])
    );
    let calls = h.api.calls().await;
    let ApiCall::CreateChat(request) = &calls[1] else {
        panic!("expected a chat request");
    };
    assert_eq!(request.message.content, "summarize");
}
