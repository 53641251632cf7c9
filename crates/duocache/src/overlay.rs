// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The activation-scoped local overlay.
//!
//! An overlay maps normalized keys to what the remote tier said about them: an entry, or
//! the knowledge that the key is absent. Each key lives in its own once-cell so concurrent
//! callers resolving the same key share one producer run, while unrelated keys never wait
//! on each other. The overlay never expires anything; it is dropped wholesale when its
//! activation ends.

use std::{
    cell::RefCell,
    collections::HashMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::sync::OnceCell;

use crate::{Entry, Error, ErrorKind, Result};

static NEXT_OVERLAY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Keys whose producers are being polled on this thread, innermost last.
    static RESOLVING: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// What the overlay knows about a key once it has been resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Resolved {
    Present(Entry),
    Absent,
}

/// The result of consulting the overlay without resolving anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    Present(Entry),
    Absent,
    NotChecked,
}

type Slot = Arc<OnceCell<Resolved>>;

#[derive(Debug)]
pub(crate) struct LocalOverlay {
    id: u64,
    closed: AtomicBool,
    slots: Mutex<HashMap<String, Slot>>,
}

impl LocalOverlay {
    pub fn new() -> Self {
        Self {
            id: NEXT_OVERLAY_ID.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, key: &str) -> Lookup {
        match self.slots.lock().get(key).and_then(|slot| slot.get()) {
            Some(Resolved::Present(entry)) => Lookup::Present(entry.clone()),
            Some(Resolved::Absent) => Lookup::Absent,
            None => Lookup::NotChecked,
        }
    }

    /// Returns the resolution for `key`, running `producer` if nobody has resolved it yet.
    ///
    /// Concurrent callers for the same key wait for the first caller's producer and observe
    /// its result. A failed producer leaves the key unresolved so a later caller retries.
    /// A producer that tries to resolve its own key on this overlay fails with
    /// [`ErrorKind::ReentrantFetch`] instead of waiting on itself.
    pub async fn fetch_or_compute<F, Fut>(&self, key: &str, producer: F) -> Result<Resolved>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resolved>>,
    {
        let slot = self.slot(key);
        if let Some(resolved) = slot.get() {
            return Ok(resolved.clone());
        }

        if mark_reentry(self.id, key) {
            return Err(Error::from_cause(
                ErrorKind::ReentrantFetch,
                format!("producer for key '{key}' tried to resolve the same key"),
            ));
        }

        let resolved = slot
            .get_or_try_init(|| Resolving {
                frame: Some(Frame::new(self.id, key)),
                inner: producer(),
            })
            .await?;
        Ok(resolved.clone())
    }

    /// Records `resolved` for `key`, replacing whatever was there.
    pub fn publish(&self, key: &str, resolved: Resolved) {
        self.slots
            .lock()
            .insert(key.to_string(), Arc::new(OnceCell::new_with(Some(resolved))));
    }

    /// Records `resolved` for `key` unless the key is already resolved or being resolved.
    pub fn publish_if_vacant(&self, key: &str, resolved: Resolved) {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            // An in-flight or finished resolution wins.
            Some(slot) => {
                let _ = slot.set(resolved);
            }
            None => {
                slots.insert(key.to_string(), Arc::new(OnceCell::new_with(Some(resolved))));
            }
        }
    }

    /// Turns a remembered miss for `key` back into an unresolved slot, so the next
    /// [`fetch_or_compute`](Self::fetch_or_compute) runs its producer. Present and
    /// in-flight slots are kept.
    pub fn reopen(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            if matches!(slot.get(), Some(Resolved::Absent)) {
                *slot = Slot::default();
            }
        }
    }

    /// Drops what the overlay knows about `key`.
    pub fn forget(&self, key: &str) {
        self.slots.lock().remove(key);
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Clears the overlay and stops it from being used again.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn slot(&self, key: &str) -> Slot {
        Arc::clone(self.slots.lock().entry(key.to_string()).or_default())
    }
}

#[derive(Debug)]
struct Frame {
    overlay: u64,
    key: String,
    reentered: bool,
}

impl Frame {
    fn new(overlay: u64, key: &str) -> Self {
        Self {
            overlay,
            key: key.to_string(),
            reentered: false,
        }
    }
}

/// Flags every frame on this thread that is producing `key` for `overlay`.
fn mark_reentry(overlay: u64, key: &str) -> bool {
    RESOLVING.with_borrow_mut(|stack| {
        let mut found = false;
        for frame in stack.iter_mut().filter(|f| f.overlay == overlay && f.key == key) {
            frame.reentered = true;
            found = true;
        }
        found
    })
}

/// Pops the frame pushed for one poll, even if the producer panics.
struct Entered;

impl Entered {
    fn push(frame: Frame) -> Self {
        RESOLVING.with_borrow_mut(|stack| stack.push(frame));
        Self
    }

    fn pop(self) -> Option<Frame> {
        let frame = RESOLVING.with_borrow_mut(Vec::pop);
        std::mem::forget(self);
        frame
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        RESOLVING.with_borrow_mut(Vec::pop);
    }
}

pin_project! {
    /// Runs a producer with its key marked as resolving on the polling thread.
    struct Resolving<F> {
        frame: Option<Frame>,
        #[pin]
        inner: F,
    }
}

impl<F> Future for Resolving<F>
where
    F: Future<Output = Result<Resolved>>,
{
    type Output = Result<Resolved>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let Some(frame) = this.frame.take() else {
            return Poll::Ready(Err(Error::from_cause(ErrorKind::ReentrantFetch, "producer polled after completion")));
        };

        let entered = Entered::push(frame);
        let poll = this.inner.poll(cx);
        let Some(frame) = entered.pop() else {
            return Poll::Ready(Err(Error::from_cause(ErrorKind::ReentrantFetch, "resolving stack corrupted")));
        };

        match poll {
            Poll::Pending => {
                *this.frame = Some(frame);
                Poll::Pending
            }
            Poll::Ready(Ok(_)) if frame.reentered => Poll::Ready(Err(Error::from_cause(
                ErrorKind::ReentrantFetch,
                format!("producer for key '{}' tried to resolve the same key", frame.key),
            ))),
            Poll::Ready(result) => Poll::Ready(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        futures::executor::block_on(f)
    }

    fn present(text: &str) -> Resolved {
        Resolved::Present(Entry::raw(text))
    }

    #[test]
    fn unknown_keys_are_not_checked() {
        let overlay = LocalOverlay::new();
        assert_eq!(overlay.lookup("k"), Lookup::NotChecked);
    }

    #[test]
    fn fetch_or_compute_runs_producer_once() {
        block_on(async {
            let overlay = LocalOverlay::new();
            let calls = AtomicUsize::new(0);

            for _ in 0..3 {
                let resolved = overlay
                    .fetch_or_compute("k", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(present("v"))
                    })
                    .await
                    .expect("resolve");
                assert_eq!(resolved, present("v"));
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(overlay.lookup("k"), Lookup::Present(Entry::raw("v")));
        });
    }

    #[test]
    fn absent_results_are_remembered() {
        block_on(async {
            let overlay = LocalOverlay::new();
            overlay
                .fetch_or_compute("k", || async { Ok(Resolved::Absent) })
                .await
                .expect("resolve");

            assert_eq!(overlay.lookup("k"), Lookup::Absent);
            let resolved = overlay
                .fetch_or_compute("k", || async { Err(Error::with_kind(ErrorKind::CorruptValue)) })
                .await
                .expect("absent key must not be recomputed");
            assert_eq!(resolved, Resolved::Absent);
        });
    }

    #[test]
    fn failed_producers_are_not_cached() {
        block_on(async {
            let overlay = LocalOverlay::new();
            let error = overlay
                .fetch_or_compute("k", || async { Err(Error::with_kind(ErrorKind::RemoteUnavailable)) })
                .await
                .expect_err("producer failed");
            assert!(error.is_remote_unavailable());
            assert_eq!(overlay.lookup("k"), Lookup::NotChecked);

            let resolved = overlay
                .fetch_or_compute("k", || async { Ok(present("retry")) })
                .await
                .expect("resolve");
            assert_eq!(resolved, present("retry"));
        });
    }

    #[test]
    fn concurrent_callers_share_one_producer() {
        block_on(async {
            let overlay = LocalOverlay::new();
            let calls = AtomicUsize::new(0);
            let (tx, rx) = futures::channel::oneshot::channel::<()>();

            let first = overlay.fetch_or_compute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                rx.await.expect("signal");
                Ok(present("shared"))
            });
            let second = overlay.fetch_or_compute("k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(present("other"))
            });
            let release = async {
                tx.send(()).expect("send");
            };

            let (first, second, ()) = futures::join!(first, second, release);
            assert_eq!(first.expect("first"), present("shared"));
            assert_eq!(second.expect("second"), present("shared"));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn callers_on_other_threads_share_one_producer() {
        let overlay = Arc::new(LocalOverlay::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let overlay = Arc::clone(&overlay);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    overlay
                        .fetch_or_compute("k", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            Ok(present("shared"))
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.expect("join").expect("resolve"), present("shared"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_producer_fails_fast() {
        block_on(async {
            let overlay = LocalOverlay::new();
            let result = overlay
                .fetch_or_compute("k", || async {
                    let inner = overlay.fetch_or_compute("k", || async { Ok(present("inner")) }).await;
                    assert_eq!(inner.expect_err("nested").kind(), ErrorKind::ReentrantFetch);
                    Ok(present("outer"))
                })
                .await;

            assert_eq!(result.expect_err("outer").kind(), ErrorKind::ReentrantFetch);
            assert_eq!(overlay.lookup("k"), Lookup::NotChecked);
        });
    }

    #[test]
    fn producers_may_resolve_other_keys() {
        block_on(async {
            let overlay = LocalOverlay::new();
            let resolved = overlay
                .fetch_or_compute("outer", || async {
                    overlay.fetch_or_compute("inner", || async { Ok(present("i")) }).await?;
                    Ok::<_, Error>(present("o"))
                })
                .await
                .expect("resolve");

            assert_eq!(resolved, present("o"));
            assert_eq!(overlay.len(), 2);
        });
    }

    #[test]
    fn same_key_on_another_overlay_is_not_reentrant() {
        block_on(async {
            let outer = LocalOverlay::new();
            let inner = LocalOverlay::new();
            let resolved = outer
                .fetch_or_compute("k", || async {
                    inner.fetch_or_compute("k", || async { Ok(present("i")) }).await?;
                    Ok::<_, Error>(present("o"))
                })
                .await
                .expect("resolve");
            assert_eq!(resolved, present("o"));
        });
    }

    #[test]
    fn publish_replaces_and_publish_if_vacant_does_not() {
        let overlay = LocalOverlay::new();
        overlay.publish_if_vacant("k", present("first"));
        overlay.publish_if_vacant("k", present("second"));
        assert_eq!(overlay.lookup("k"), Lookup::Present(Entry::raw("first")));

        overlay.publish("k", Resolved::Absent);
        assert_eq!(overlay.lookup("k"), Lookup::Absent);
    }

    #[test]
    fn reopen_only_replaces_remembered_misses() {
        let overlay = LocalOverlay::new();
        overlay.publish("gone", Resolved::Absent);
        overlay.publish("kept", present("v"));

        overlay.reopen("gone");
        overlay.reopen("kept");
        overlay.reopen("unknown");

        assert_eq!(overlay.lookup("gone"), Lookup::NotChecked);
        assert_eq!(overlay.lookup("kept"), Lookup::Present(Entry::raw("v")));
        assert_eq!(overlay.lookup("unknown"), Lookup::NotChecked);

        let calls = AtomicUsize::new(0);
        let resolved = block_on(async {
            let first = overlay.fetch_or_compute("gone", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(present("new"))
            });
            let second = overlay.fetch_or_compute("gone", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(present("other"))
            });
            futures::join!(first, second)
        });
        assert_eq!(resolved.0.expect("first"), present("new"));
        assert_eq!(resolved.1.expect("second"), present("new"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forget_and_close_drop_knowledge() {
        let overlay = LocalOverlay::new();
        overlay.publish("a", present("1"));
        overlay.publish("b", present("2"));

        overlay.forget("a");
        assert_eq!(overlay.lookup("a"), Lookup::NotChecked);
        assert!(!overlay.is_closed());

        overlay.close();
        assert_eq!(overlay.len(), 0);
        assert!(overlay.is_closed());
    }
}
