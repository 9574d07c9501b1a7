use futures::future::BoxFuture;
use std::future::Future;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::decoder::IssueDecoder;
use crate::error::{Error, Result};
use crate::models::Issue;

/// 生産側と消費側の間のキュー容量
pub const QUEUE_CAPACITY: usize = 20;

type Producer = Box<dyn FnOnce(mpsc::Sender<Issue>) -> BoxFuture<'static, ()> + Send>;

enum State {
    /// まだ生産側を起動していない
    Pending(Producer),
    Running {
        queue: mpsc::Receiver<Issue>,
        producer: JoinHandle<()>,
    },
    Finished,
}

/// 一括取得したIssueを先頭から1件ずつ取り出す、一方向・一回限りのイテレーター
///
/// 最初の `next()` で生産側タスクを起動し、以後は容量 [`QUEUE_CAPACITY`] のキュー越しに
/// 文書の順序どおりIssueを受け取る。消費が遅い場合、生産側はキューが空くまで待機する。
pub struct IssueIterator {
    requested: usize,
    delivered: usize,
    truncated: bool,
    state: State,
}

impl IssueIterator {
    /// `requested` 件を生成する生産側から新しいイテレーターを作成
    pub fn new<F, Fut>(requested: usize, producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Issue>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            requested,
            delivered: 0,
            truncated: false,
            state: State::Pending(Box::new(move |sink| -> BoxFuture<'static, ()> {
                Box::pin(producer(sink))
            })),
        }
    }

    /// XML文書を直接デコードするイテレーターを作成
    pub fn from_reader<R>(requested: usize, source: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        Self::new(requested, move |sink| async move {
            IssueDecoder::new().decode(source, sink).await;
        })
    }

    pub fn empty() -> Self {
        Self {
            requested: 0,
            delivered: 0,
            truncated: false,
            state: State::Finished,
        }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn is_started(&self) -> bool {
        !matches!(self.state, State::Pending(_))
    }

    /// キューに溜まっている未取得のIssue数
    pub fn queued(&self) -> usize {
        match &self.state {
            State::Running { queue, .. } => queue.len(),
            _ => 0,
        }
    }

    /// 要求数に達するまで真（生産側が途中で終了した場合は偽）
    pub fn has_next(&self) -> bool {
        !self.truncated && self.delivered < self.requested
    }

    /// 次のIssueを取り出す。キューが空の間は待機する
    pub async fn next(&mut self) -> Result<Issue> {
        if !self.has_next() {
            return Err(Error::IllegalState(format!(
                "no more issues ({} of {} delivered)",
                self.delivered, self.requested
            )));
        }

        self.start();
        let State::Running { queue, .. } = &mut self.state else {
            return Err(Error::IllegalState("issue producer is not running".to_string()));
        };

        match queue.recv().await {
            Some(issue) => {
                self.delivered += 1;
                Ok(issue)
            }
            None => {
                warn!(
                    delivered = self.delivered,
                    requested = self.requested,
                    "Issue producer finished early"
                );
                self.truncated = true;
                self.state = State::Finished;
                Err(Error::IncompleteBatch {
                    delivered: self.delivered,
                    requested: self.requested,
                })
            }
        }
    }

    /// 取り出し済みの要素の削除はサポートしない
    pub fn remove(&mut self) -> Result<()> {
        Err(Error::Unsupported("remove is not supported by IssueIterator".to_string()))
    }

    /// 残りをすべて取り出す
    pub async fn collect_all(mut self) -> Result<Vec<Issue>> {
        let mut issues = Vec::with_capacity(self.requested - self.delivered);
        while self.has_next() {
            issues.push(self.next().await?);
        }
        Ok(issues)
    }

    fn start(&mut self) {
        if !matches!(self.state, State::Pending(_)) {
            return;
        }
        let State::Pending(producer) = std::mem::replace(&mut self.state, State::Finished) else {
            return;
        };

        debug!(requested = self.requested, "Starting issue producer");
        let (sink, queue) = mpsc::channel(QUEUE_CAPACITY);
        let producer = tokio::spawn(producer(sink));
        self.state = State::Running { queue, producer };
    }
}

impl Drop for IssueIterator {
    fn drop(&mut self) {
        if let State::Running { producer, .. } = &self.state {
            producer.abort();
        }
    }
}

impl std::fmt::Debug for IssueIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueIterator")
            .field("requested", &self.requested)
            .field("delivered", &self.delivered)
            .field("started", &self.is_started())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn export(ids: &[&str]) -> Vec<u8> {
        let mut xml = String::from("<bugzilla version=\"4.4\">");
        for id in ids {
            xml.push_str(&format!(
                "<bug><bug_id>{}</bug_id><bug_status>NEW</bug_status></bug>",
                id
            ));
        }
        xml.push_str("</bugzilla>");
        xml.into_bytes()
    }

    #[tokio::test]
    async fn test_yields_exactly_requested_count() {
        // Given: 3件を要求するイテレーター
        let mut issues = IssueIterator::from_reader(3, std::io::Cursor::new(export(&["1", "2", "3"])));

        // When: has_next が偽になるまで取り出す
        let mut ids = Vec::new();
        while issues.has_next() {
            ids.push(issues.next().await.unwrap().id);
        }

        // Then: ちょうど3件で終わる
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(issues.delivered(), 3);
        assert!(!issues.has_next());
    }

    #[tokio::test]
    async fn test_next_past_end_is_illegal_state_every_time() {
        let mut issues = IssueIterator::from_reader(1, std::io::Cursor::new(export(&["1"])));
        issues.next().await.unwrap();

        for _ in 0..3 {
            assert!(matches!(issues.next().await, Err(Error::IllegalState(_))));
        }
    }

    #[tokio::test]
    async fn test_producer_starts_lazily() {
        // Given: 起動を記録する生産側
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);
        let mut issues = IssueIterator::new(1, move |sink| async move {
            flag.store(true, Ordering::SeqCst);
            let _ = sink
                .send(Issue {
                    id: "1".to_string(),
                    ..Default::default()
                })
                .await;
        });

        // Then: next() を呼ぶまで起動しない
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!issues.is_started());
        assert!(!started.load(Ordering::SeqCst));

        let issue = issues.next().await.unwrap();
        assert_eq!(issue.id, "1");
        assert!(started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_next_waits_until_an_issue_is_queued() {
        // Given: 合図があるまで送信しない生産側
        let (go, wait) = tokio::sync::oneshot::channel::<()>();
        let mut issues = IssueIterator::new(1, move |sink| async move {
            if wait.await.is_ok() {
                let _ = sink
                    .send(Issue {
                        id: "7".to_string(),
                        ..Default::default()
                    })
                    .await;
            }
        });

        // Then: キューが空の間は待機する
        {
            let mut pending = tokio_test::task::spawn(issues.next());
            tokio_test::assert_pending!(pending.poll());
        }
        assert!(issues.is_started());

        // When: 生産側が送信する
        go.send(()).unwrap();

        // Then: 取り出せる
        assert_eq!(issues.next().await.unwrap().id, "7");
        assert!(!issues.has_next());
    }

    #[tokio::test]
    async fn test_document_order_is_passed_through() {
        // Given: 要求順(10, 11, 12)と異なる順序の文書
        let mut issues = IssueIterator::from_reader(3, std::io::Cursor::new(export(&["11", "10", "12"])));

        // When: すべて取り出す
        let mut ids = Vec::new();
        while issues.has_next() {
            ids.push(issues.next().await.unwrap().id);
        }

        // Then: 並べ替えずに文書の順序で届く
        assert_eq!(ids, vec!["11", "10", "12"]);
    }

    #[tokio::test]
    async fn test_queue_is_bounded_under_slow_consumer() {
        // Given: 50件を高速に生成する生産側
        let ids: Vec<String> = (1..=50).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut issues = IssueIterator::from_reader(50, std::io::Cursor::new(export(&refs)));

        // When: 1件ずつゆっくり取り出す
        let first = issues.next().await.unwrap();
        assert_eq!(first.id, "1");
        let mut max_seen = 0;
        let mut delivered = vec![first.id];
        while issues.has_next() {
            tokio::time::sleep(Duration::from_millis(2)).await;
            max_seen = max_seen.max(issues.queued());
            delivered.push(issues.next().await.unwrap().id);
        }

        // Then: キューは容量を超えず、全件が順序どおり届く
        assert!(max_seen <= QUEUE_CAPACITY, "queue held {} issues", max_seen);
        assert!(max_seen > 0);
        assert_eq!(delivered, ids);
    }

    #[tokio::test]
    async fn test_early_producer_end_reports_incomplete_batch() {
        let mut issues = IssueIterator::from_reader(3, std::io::Cursor::new(export(&["1"])));

        assert_eq!(issues.next().await.unwrap().id, "1");
        match issues.next().await {
            Err(Error::IncompleteBatch { delivered, requested }) => {
                assert_eq!(delivered, 1);
                assert_eq!(requested, 3);
            }
            other => panic!("Expected IncompleteBatch, got {:?}", other),
        }
        assert!(!issues.has_next());
        assert!(matches!(issues.next().await, Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_remove_is_unsupported() {
        let mut issues = IssueIterator::empty();
        assert!(matches!(issues.remove(), Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_empty_iterator() {
        let mut issues = IssueIterator::empty();

        assert!(!issues.has_next());
        assert!(matches!(issues.next().await, Err(Error::IllegalState(_))));
        assert!(IssueIterator::empty().collect_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_stops_producer() {
        // Given: キューが満杯になるまで生成し続ける生産側
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let mut issues = IssueIterator::new(100, move |sink| async move {
            for i in 0..100 {
                let issue = Issue {
                    id: i.to_string(),
                    ..Default::default()
                };
                if sink.send(issue).await.is_err() {
                    return;
                }
            }
            flag.store(true, Ordering::SeqCst);
        });
        issues.next().await.unwrap();

        // When: イテレーターを破棄する
        drop(issues);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Then: 生産側は最後まで進まない
        assert!(!finished.load(Ordering::SeqCst));
    }
}
