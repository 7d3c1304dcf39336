mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use httpcall::{
    Client, Connection, Dispatcher, Error, Request, Response, ResponseBody, Result, Transport,
};
use support::{FakePool, FixedDns};

/// A transport whose exchanges park until the test hands out a permit,
/// tracking the highwater mark of concurrent exchanges.
struct GatedTransport {
    permits: Mutex<mpsc::Receiver<()>>,
    started: mpsc::Sender<()>,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl GatedTransport {
    fn new() -> (Arc<GatedTransport>, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (permit_sender, permit_receiver) = mpsc::channel();
        let (started_sender, started_receiver) = mpsc::channel();
        (
            Arc::new(GatedTransport {
                permits: Mutex::new(permit_receiver),
                started: started_sender,
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }),
            permit_sender,
            started_receiver,
        )
    }
}

impl Transport for GatedTransport {
    fn exchange(&self, request: &Request, _connection: &dyn Connection) -> Result<Response> {
        let live = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(live, Ordering::SeqCst);
        let _ = self.started.send(());
        // Park until the test releases this exchange.
        let waited = self
            .permits
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        waited.map_err(|_| Error::Canceled)?;
        Response::builder()
            .request(request.clone())
            .status(StatusCode::OK)
            .body(ResponseBody::buffered("ok"))
            .build()
    }
}

fn gated_client(
    dispatcher: Arc<Dispatcher>,
) -> (Client, mpsc::Sender<()>, mpsc::Receiver<()>, Arc<GatedTransport>) {
    support::init_tracing();
    let (transport, permits, started) = GatedTransport::new();
    let client = Client::builder()
        .dispatcher(dispatcher)
        .connection_pool(FakePool::new() as _)
        .transport(Arc::clone(&transport) as _)
        .dns(FixedDns::localhost())
        .build()
        .expect("client");
    (client, permits, started, transport)
}

fn enqueue_get(client: &Client, url: &str, done: &mpsc::Sender<Result<StatusCode>>) {
    let done = done.clone();
    let call = client.new_call(Request::get(url).expect("request"));
    call.enqueue(move |result| {
        let _ = done.send(result.map(|response| response.status()));
    });
}

#[test]
fn the_per_host_cap_limits_concurrency_for_one_host() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.set_max_requests_per_host(2).expect("limit");
    let (client, permits, started, transport) = gated_client(Arc::clone(&dispatcher));
    let (done_sender, done_receiver) = mpsc::channel();

    for i in 0..6 {
        enqueue_get(&client, &format!("http://a.test/{i}"), &done_sender);
    }

    // Exactly two exchanges may start while the rest stay queued.
    started.recv_timeout(Duration::from_secs(5)).expect("first");
    started.recv_timeout(Duration::from_secs(5)).expect("second");
    assert!(started.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(dispatcher.running_count(), 2);
    assert_eq!(dispatcher.queued_count(), 4);

    for _ in 0..6 {
        permits.send(()).expect("release");
    }
    for _ in 0..6 {
        let status = done_receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("completion")
            .expect("status");
        assert_eq!(status, StatusCode::OK);
    }
    assert!(transport.max_concurrent.load(Ordering::SeqCst) <= 2);
    assert_eq!(dispatcher.running_count(), 0);
    assert_eq!(dispatcher.queued_count(), 0);
}

#[test]
fn a_saturated_host_does_not_block_other_hosts() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.set_max_requests_per_host(1).expect("limit");
    let (client, permits, started, _transport) = gated_client(Arc::clone(&dispatcher));
    let (done_sender, done_receiver) = mpsc::channel();

    // a1 runs; a2 queues behind the host cap; b1 arrives later but must be
    // promoted past a2.
    enqueue_get(&client, "http://a.test/1", &done_sender);
    started.recv_timeout(Duration::from_secs(5)).expect("a1");
    enqueue_get(&client, "http://a.test/2", &done_sender);
    enqueue_get(&client, "http://b.test/1", &done_sender);

    started.recv_timeout(Duration::from_secs(5)).expect("b1 promoted");
    assert_eq!(dispatcher.running_count(), 2);
    assert_eq!(dispatcher.queued_count(), 1);

    for _ in 0..3 {
        permits.send(()).expect("release");
    }
    for _ in 0..3 {
        done_receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("completion")
            .expect("status");
    }
}

#[test]
fn raising_the_global_cap_promotes_queued_calls() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.set_max_requests(1).expect("limit");
    let (client, permits, started, _transport) = gated_client(Arc::clone(&dispatcher));
    let (done_sender, done_receiver) = mpsc::channel();

    enqueue_get(&client, "http://a.test/1", &done_sender);
    enqueue_get(&client, "http://b.test/1", &done_sender);
    started.recv_timeout(Duration::from_secs(5)).expect("first");
    assert_eq!(dispatcher.queued_count(), 1);

    dispatcher.set_max_requests(2).expect("limit");
    started.recv_timeout(Duration::from_secs(5)).expect("second");
    assert_eq!(dispatcher.queued_count(), 0);

    permits.send(()).expect("release");
    permits.send(()).expect("release");
    for _ in 0..2 {
        done_receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("completion")
            .expect("status");
    }
}

#[test]
fn canceling_a_queued_call_removes_it_and_reports_canceled() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.set_max_requests_per_host(1).expect("limit");
    let (client, permits, started, _transport) = gated_client(Arc::clone(&dispatcher));
    let (done_sender, done_receiver) = mpsc::channel();

    enqueue_get(&client, "http://a.test/1", &done_sender);
    started.recv_timeout(Duration::from_secs(5)).expect("running");

    let queued = client.new_call(Request::get("http://a.test/2").expect("request"));
    let queued_done = done_sender.clone();
    queued.enqueue(move |result| {
        let _ = queued_done.send(result.map(|response| response.status()));
    });
    assert_eq!(dispatcher.queued_count(), 1);

    queued.cancel();
    assert!(queued.is_canceled());
    let outcome = done_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("canceled completion");
    assert!(matches!(outcome, Err(Error::Canceled)));
    assert_eq!(dispatcher.queued_count(), 0);

    // The running call is unaffected.
    permits.send(()).expect("release");
    let status = done_receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("completion")
        .expect("status");
    assert_eq!(status, StatusCode::OK);
}

#[test]
fn the_idle_callback_fires_when_the_last_call_finishes() {
    let dispatcher = Arc::new(Dispatcher::new());
    let (idle_sender, idle_receiver) = mpsc::channel();
    dispatcher.set_idle_callback(move || {
        let _ = idle_sender.send(());
    });
    let (client, permits, started, _transport) = gated_client(Arc::clone(&dispatcher));
    let (done_sender, done_receiver) = mpsc::channel();

    enqueue_get(&client, "http://a.test/1", &done_sender);
    enqueue_get(&client, "http://b.test/1", &done_sender);
    started.recv_timeout(Duration::from_secs(5)).expect("first");
    started.recv_timeout(Duration::from_secs(5)).expect("second");
    assert!(idle_receiver.try_recv().is_err());

    permits.send(()).expect("release");
    permits.send(()).expect("release");
    for _ in 0..2 {
        done_receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("completion")
            .expect("status");
    }
    idle_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("went idle");
}

#[test]
fn cancel_all_reaches_a_running_synchronous_call() {
    let dispatcher = Arc::new(Dispatcher::new());
    let (client, permits, started, _transport) = gated_client(Arc::clone(&dispatcher));

    let call = Arc::new(client.new_call(Request::get("http://a.test/").expect("request")));
    let running = Arc::clone(&call);
    let worker = std::thread::spawn(move || running.execute());

    started.recv_timeout(Duration::from_secs(5)).expect("running");
    assert_eq!(dispatcher.running_count(), 1);
    assert!(!call.is_canceled());

    dispatcher.cancel_all();
    assert!(call.is_canceled());

    permits.send(()).expect("release");
    let _ = worker.join().expect("join");
    assert_eq!(dispatcher.running_count(), 0);
}

#[test]
fn a_call_cannot_be_enqueued_twice() {
    let dispatcher = Arc::new(Dispatcher::new());
    let (client, permits, _started, _transport) = gated_client(dispatcher);
    let (done_sender, done_receiver) = mpsc::channel();

    let call = client.new_call(Request::get("http://a.test/").expect("request"));
    enqueue_once(&call, &done_sender);
    enqueue_once(&call, &done_sender);
    permits.send(()).expect("release");

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        outcomes.push(
            done_receiver
                .recv_timeout(Duration::from_secs(10))
                .expect("completion"),
        );
    }
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(Error::AlreadyExecuted)))
            .count(),
        1
    );
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
}

fn enqueue_once(call: &httpcall::Call, done: &mpsc::Sender<Result<StatusCode>>) {
    let done = done.clone();
    call.enqueue(move |result| {
        let _ = done.send(result.map(|response| response.status()));
    });
}
