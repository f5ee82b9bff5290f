//! Dispatch, retry and cancellation behaviour of the request orchestrator,
//! driven by a scripted transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream;
use skein::config::SessionClass;
use skein::transport::{AuthDisposition, BodyStream, Credential, Method, Request, TransportError};
use skein::{NetError, RequestOrchestrator};
use skein_transport::testing::{Invalidation, MockHttpTransport, MockOutcome};
use url::Url;

fn url(path: &str) -> Url { Url::parse(&format!("http://example.test/{path}")).unwrap() }

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn paths(transport: &MockHttpTransport) -> Vec<String> {
    transport.dispatches().iter().map(|d| d.url.path().to_string()).collect()
}

#[tokio::test]
async fn test_records_dispatch_in_order_one_at_a_time() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b"ok"));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b", "c"] {
        let order = order.clone();
        orchestrator
            .data(move || Request::get(url(name)))
            .on_success(move |_| order.lock().unwrap().push(name));
    }
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;
    wait_until(|| !transport.invalidations().is_empty()).await;

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(paths(&transport), vec!["/a", "/b", "/c"]);
    assert_eq!(transport.max_in_flight(), 1);
    assert_eq!(transport.sessions_opened(), 1);
    assert_eq!(transport.invalidations(), vec![Invalidation::Finish]);
}

#[tokio::test]
async fn test_data_callbacks_receive_buffered_body() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b"hello"));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let received = Arc::new(Mutex::new(Vec::new()));

    let first = received.clone();
    let second = received.clone();
    orchestrator
        .data(|| Request::get(url("greeting")))
        .on_data(move |response, body| first.lock().unwrap().push((response.status, body.clone())))
        .on_data(move |_, body| second.lock().unwrap().push((0, body.clone())));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    let received = received.lock().unwrap();
    assert_eq!(
        *received,
        vec![(200, Bytes::from_static(b"hello")), (0, Bytes::from_static(b"hello"))]
    );
}

#[tokio::test]
async fn test_retry_budget_allows_extra_attempts_then_fails_once() {
    let transport = MockHttpTransport::new(|_| MockOutcome::Fail(TransportError::timeout("slow")));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let failures = Arc::new(Mutex::new(Vec::new()));

    let sink = failures.clone();
    orchestrator
        .data(|| Request::get(url("flaky")))
        .retry(2)
        .on_failure(move |error| sink.lock().unwrap().push(error.clone()));
    let _token = orchestrator.fire();

    wait_until(|| !failures.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(transport.dispatches().len(), 3);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], NetError::Transport(e) if e.is_timeout()));
    assert_eq!(orchestrator.pending(), 0);
}

#[tokio::test]
async fn test_global_retry_and_failure_apply_without_record_values() {
    let transport = MockHttpTransport::new(|_| MockOutcome::Fail(TransportError::protocol("bad frame")));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let failures = Arc::new(AtomicUsize::new(0));

    let count = failures.clone();
    orchestrator
        .global_retry(1)
        .global_failure(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .data(|| Request::get(url("global")));
    let _token = orchestrator.fire();

    wait_until(|| failures.load(Ordering::SeqCst) == 1).await;

    assert_eq!(transport.dispatches().len(), 2);
}

#[tokio::test]
async fn test_exhausted_failure_clears_remaining_records() {
    let transport = MockHttpTransport::new(|dispatch| {
        if dispatch.url.path() == "/bad" {
            MockOutcome::Fail(TransportError::closed("reset"))
        } else {
            MockOutcome::ok(b"fine")
        }
    });
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let failures = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));

    let count = failures.clone();
    orchestrator.data(|| Request::get(url("bad"))).on_failure(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    for name in ["b", "c"] {
        let count = successes.clone();
        orchestrator.data(move || Request::get(url(name))).on_success(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    let _token = orchestrator.fire();

    wait_until(|| failures.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(paths(&transport), vec!["/bad"]);
    assert_eq!(successes.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.pending(), 0);
}

#[tokio::test]
async fn test_failure_callback_can_queue_new_work() {
    let transport = MockHttpTransport::new(|dispatch| {
        if dispatch.url.path() == "/bad" {
            MockOutcome::Fail(TransportError::closed("reset"))
        } else {
            MockOutcome::ok(b"fine")
        }
    });
    let orchestrator = Arc::new(RequestOrchestrator::new(transport.clone()));
    let recovered = Arc::new(AtomicUsize::new(0));

    let again = orchestrator.clone();
    let count = recovered.clone();
    orchestrator.data(|| Request::get(url("bad"))).on_failure(move |_| {
        let count = count.clone();
        again.data(|| Request::get(url("fallback"))).on_success(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        again.fire();
    });
    let _token = orchestrator.fire();

    wait_until(|| recovered.load(Ordering::SeqCst) == 1).await;

    assert_eq!(paths(&transport), vec!["/bad", "/fallback"]);
}

#[tokio::test]
async fn test_missing_response_is_retried_then_reported() {
    let transport = MockHttpTransport::new(|_| MockOutcome::NoResponse);
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let failures = Arc::new(Mutex::new(Vec::new()));

    let sink = failures.clone();
    orchestrator
        .data(|| Request::get(url("void")))
        .retry(1)
        .on_failure(move |error| sink.lock().unwrap().push(error.clone()));
    let _token = orchestrator.fire();

    wait_until(|| !failures.lock().unwrap().is_empty()).await;

    assert_eq!(transport.dispatches().len(), 2);
    assert_eq!(*failures.lock().unwrap(), vec![NetError::NoResponse]);
}

#[tokio::test]
async fn test_cancel_now_drops_queue_and_aborts_current() {
    let transport = MockHttpTransport::new(|_| MockOutcome::Pending);
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let failures = Arc::new(AtomicUsize::new(0));

    for name in ["one", "two", "three"] {
        let count = failures.clone();
        orchestrator.data(move || Request::get(url(name))).on_failure(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    let token = orchestrator.fire();
    assert!(token.is_active());

    wait_until(|| transport.dispatches().len() == 1).await;
    token.cancel_now();

    assert!(!token.is_active());
    assert_eq!(orchestrator.pending(), 0);
    assert_eq!(transport.invalidations(), vec![Invalidation::Cancel]);

    token.cancel_now();
    token.cancel_after_current_task();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(transport.dispatches().len(), 1);
    assert_eq!(transport.invalidations(), vec![Invalidation::Cancel]);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_after_current_lets_session_finish() {
    let transport = MockHttpTransport::new(|_| MockOutcome::Pending);
    let orchestrator = RequestOrchestrator::new(transport.clone());

    orchestrator.data(|| Request::get(url("first")));
    orchestrator.data(|| Request::get(url("second")));
    let token = orchestrator.fire();

    wait_until(|| transport.dispatches().len() == 1).await;
    token.cancel_after_current_task();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(orchestrator.pending(), 0);
    assert_eq!(transport.invalidations(), vec![Invalidation::Finish]);
    assert_eq!(paths(&transport), vec!["/first"]);
}

#[tokio::test]
async fn test_fire_again_after_cancel_opens_new_session() {
    let transport = MockHttpTransport::new(|dispatch| {
        if dispatch.url.path() == "/stuck" { MockOutcome::Pending } else { MockOutcome::ok(b"fresh") }
    });
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let done = Arc::new(AtomicUsize::new(0));

    orchestrator.data(|| Request::get(url("stuck")));
    orchestrator.data(|| Request::get(url("queued")));
    let token = orchestrator.fire();
    wait_until(|| transport.dispatches().len() == 1).await;
    token.cancel_now();

    let count = done.clone();
    orchestrator.data(|| Request::get(url("fresh"))).on_success(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let _token = orchestrator.fire();

    wait_until(|| done.load(Ordering::SeqCst) == 1).await;

    assert_eq!(paths(&transport), vec!["/stuck", "/fresh"]);
    assert_eq!(transport.sessions_opened(), 2);
}

#[tokio::test]
async fn test_firing_twice_does_not_duplicate_dispatch() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b""));
    let orchestrator = RequestOrchestrator::new(transport.clone());

    orchestrator.data(|| Request::get(url("x")));
    orchestrator.data(|| Request::get(url("y")));
    let _first = orchestrator.fire();
    let _second = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(paths(&transport), vec!["/x", "/y"]);
    assert_eq!(transport.max_in_flight(), 1);
}

#[tokio::test]
async fn test_stream_upload_without_body_or_producer_is_skipped() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b""));
    let orchestrator = RequestOrchestrator::new(transport.clone());

    orchestrator.upload_stream(|| Request::new(Method::Put, url("empty")));
    orchestrator.data(|| Request::get(url("data")));
    orchestrator
        .upload_stream(|| Request::new(Method::Put, url("produced")))
        .stream_producer(|| None);
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    let kinds: Vec<_> = transport.dispatches().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec!["data", "upload-stream"]);
    assert_eq!(paths(&transport), vec!["/data", "/produced"]);
}

#[tokio::test]
async fn test_redirect_followed_only_with_handler() {
    let transport = MockHttpTransport::new(|dispatch| {
        if dispatch.url.path() == "/moved" {
            MockOutcome::Redirect { location: url("new-home") }
        } else {
            MockOutcome::ok(b"")
        }
    });
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let followed = outcomes.clone();
    orchestrator
        .data(|| Request::get(url("moved")))
        .on_redirect(|_, proposed| Some(proposed))
        .on_success(move |r| followed.lock().unwrap().push((r.status, r.url.path().to_string())));
    let refused = outcomes.clone();
    orchestrator
        .data(|| Request::get(url("moved")))
        .on_success(move |r| refused.lock().unwrap().push((r.status, r.url.path().to_string())));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![(200, "/new-home".to_string()), (302, "/moved".to_string())]
    );
}

#[tokio::test]
async fn test_global_redirect_handler_applies_to_all_records() {
    let transport = MockHttpTransport::new(|dispatch| {
        if dispatch.url.path() == "/old" {
            MockOutcome::Redirect { location: url("current") }
        } else {
            MockOutcome::ok(b"")
        }
    });
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let sink = statuses.clone();
    orchestrator
        .global_redirect(|_, proposed| Some(proposed))
        .data(|| Request::get(url("old")))
        .on_success(move |r| sink.lock().unwrap().push(r.status));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(*statuses.lock().unwrap(), vec![200]);
}

#[tokio::test]
async fn test_task_auth_handler_answers_challenge() {
    let transport = MockHttpTransport::new(|_| MockOutcome::Challenge);
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let sink = statuses.clone();
    orchestrator
        .data(|| Request::get(url("private")))
        .on_task_auth(|challenge| {
            assert_eq!(challenge.protection_space.host, "example.test");
            AuthDisposition::UseCredential(Credential::new("user", "secret"))
        })
        .on_success(move |r| sink.lock().unwrap().push(r.status));
    let sink = statuses.clone();
    orchestrator
        .data(|| Request::get(url("private")))
        .on_success(move |r| sink.lock().unwrap().push(r.status));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(*statuses.lock().unwrap(), vec![200, 401]);
}

#[tokio::test]
async fn test_upload_and_download_progress_reach_callbacks() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b"file contents"));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let uploaded = Arc::new(Mutex::new(Vec::new()));
    let downloaded = Arc::new(Mutex::new(Vec::new()));
    let saved = Arc::new(Mutex::new(Vec::new()));

    let sink = uploaded.clone();
    orchestrator
        .upload_data(|| (Request::new(Method::Post, url("upload")), Bytes::from_static(b"abc")))
        .on_upload_progress(move |sent, expected| sink.lock().unwrap().push((sent, expected)));
    let progress = downloaded.clone();
    let contents = saved.clone();
    orchestrator
        .download(|| Request::get(url("file.bin")))
        .on_download_progress(move |written, expected| progress.lock().unwrap().push((written, expected)))
        .on_download_finished(move |path| {
            *contents.lock().unwrap() = std::fs::read(path).unwrap();
        });
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(*uploaded.lock().unwrap(), vec![(3, Some(3))]);
    assert_eq!(*downloaded.lock().unwrap(), vec![(13, Some(13))]);
    assert_eq!(*saved.lock().unwrap(), b"file contents".to_vec());
}

#[tokio::test]
async fn test_session_uses_configured_snapshot() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b""));
    let orchestrator = RequestOrchestrator::new(transport.clone());

    orchestrator
        .session_class(SessionClass::Ephemeral)
        .append_http_additional_headers([("X-Trace", "1")])
        .request_timeout(Duration::from_secs(5))
        .data(|| Request::get(url("configured")));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    let snapshot = transport.last_snapshot().unwrap();
    assert_eq!(snapshot.session_class(), &SessionClass::Ephemeral);
    assert_eq!(snapshot.additional_headers().get("X-Trace").map(String::as_str), Some("1"));
    assert_eq!(snapshot.request_timeout(), Duration::from_secs(5));
    assert_eq!(orchestrator.configuration_snapshot(), snapshot);
}

#[tokio::test]
async fn test_session_auth_handler_answers_session_challenge() {
    let transport = MockHttpTransport::new(|_| MockOutcome::SessionChallenge);
    let answered = RequestOrchestrator::new(transport.clone());
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let sink = statuses.clone();
    answered
        .session_auth(|challenge| {
            assert_eq!(challenge.protection_space.host, "example.test");
            assert_eq!(challenge.protection_space.port, 80);
            AuthDisposition::UseCredential(Credential::new("user", "secret"))
        })
        .data(|| Request::get(url("session")))
        .on_success(move |r| sink.lock().unwrap().push(r.status));
    let _token = answered.fire();
    wait_until(|| answered.pending() == 0).await;

    let unanswered = RequestOrchestrator::new(transport.clone());
    let sink = statuses.clone();
    unanswered
        .data(|| Request::get(url("session")))
        .on_success(move |r| sink.lock().unwrap().push(r.status));
    let _token = unanswered.fire();
    wait_until(|| unanswered.pending() == 0).await;

    assert_eq!(*statuses.lock().unwrap(), vec![200, 401]);
}

#[tokio::test]
async fn test_stream_producer_supplies_upload_body() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b""));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let produced = Arc::new(AtomicUsize::new(0));
    let uploaded = Arc::new(Mutex::new(Vec::new()));

    let count = produced.clone();
    let sink = uploaded.clone();
    orchestrator
        .upload_stream(|| Request::new(Method::Put, url("streamed")))
        .stream_producer(move || {
            count.fetch_add(1, Ordering::SeqCst);
            let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"stream"))];
            let body: BodyStream = Box::pin(stream::iter(chunks));
            Some(body)
        })
        .on_upload_progress(move |sent, expected| sink.lock().unwrap().push((sent, expected)));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(*uploaded.lock().unwrap(), vec![(12, Some(12))]);
    assert_eq!(paths(&transport), vec!["/streamed"]);
}

#[tokio::test]
async fn test_metrics_reach_analyzer() {
    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b"measured"));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let collected = Arc::new(Mutex::new(Vec::new()));

    let sink = collected.clone();
    orchestrator
        .upload_data(|| (Request::new(Method::Post, url("metrics")), Bytes::from_static(b"four")))
        .analyze_metrics(move |metrics| sink.lock().unwrap().push((metrics.status, metrics.bytes_sent)));
    orchestrator.data(|| Request::get(url("unmeasured")));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(*collected.lock().unwrap(), vec![(Some(200), 4)]);
}

#[tokio::test]
async fn test_upload_file_dispatches_file_contents() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), b"0123456789").unwrap();
    let path = file.path().to_path_buf();

    let transport = MockHttpTransport::new(|_| MockOutcome::ok(b""));
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let uploaded = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let progress = uploaded.clone();
    let sink = statuses.clone();
    orchestrator
        .upload_file(move || (Request::new(Method::Put, url("file")), path.clone()))
        .on_upload_progress(move |sent, expected| progress.lock().unwrap().push((sent, expected)))
        .on_success(move |r| sink.lock().unwrap().push(r.status));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    let kinds: Vec<_> = transport.dispatches().iter().map(|d| d.kind).collect();
    assert_eq!(kinds, vec!["upload-file"]);
    assert_eq!(*uploaded.lock().unwrap(), vec![(10, Some(10))]);
    assert_eq!(*statuses.lock().unwrap(), vec![200]);
}

#[tokio::test]
async fn test_retry_discards_body_of_failed_attempt() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let count = attempts.clone();
    let transport = MockHttpTransport::new(move |_| {
        if count.fetch_add(1, Ordering::SeqCst) == 0 {
            MockOutcome::PartialFail {
                body: Bytes::from_static(b"stale"),
                error: TransportError::closed("reset mid-body"),
            }
        } else {
            MockOutcome::ok(b"fresh")
        }
    });
    let orchestrator = RequestOrchestrator::new(transport.clone());
    let bodies = Arc::new(Mutex::new(Vec::new()));

    let sink = bodies.clone();
    orchestrator
        .data(|| Request::get(url("partial")))
        .retry(1)
        .on_data(move |_, body| sink.lock().unwrap().push(body.clone()));
    let _token = orchestrator.fire();

    wait_until(|| orchestrator.pending() == 0).await;

    assert_eq!(transport.dispatches().len(), 2);
    assert_eq!(*bodies.lock().unwrap(), vec![Bytes::from_static(b"fresh")]);
}
