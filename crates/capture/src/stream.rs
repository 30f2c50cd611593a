use crate::camera::{FrameSource, SourceKind};
use crate::decoder::MjpegDecoder;
use crate::errors::CaptureError;
use crate::frame::Frame;
use crate::mjpeg::JpegSplitter;
use std::{
    io::Read,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const CHUNK_SIZE: usize = 4096;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

type LatestFrame = Arc<Mutex<Option<(Frame, Instant)>>>;

/// MJPEG-over-HTTP source (simulator camera server or IP camera).
///
/// A background thread reads the body and decodes frames as they complete;
/// `next_frame` never blocks on the network.
pub struct StreamSource {
    latest: LatestFrame,
    stale_after: Duration,
    stop: Arc<AtomicBool>,
    _reader: JoinHandle<()>,
}

fn connect(agent: &ureq::Agent, url: &str) -> Result<Box<dyn Read + Send + Sync>, CaptureError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| CaptureError::open(url, e))?;
    Ok(response.into_reader())
}

impl StreamSource {
    /// Connects once up front so an unreachable URL fails construction.
    pub fn open(url: &str, read_timeout: Duration) -> Result<Self, CaptureError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(read_timeout)
            .timeout_read(read_timeout)
            .build();
        let body = connect(&agent, url)?;

        tracing::info!(url, "MJPEG stream connected");

        let latest: LatestFrame = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let decoder = MjpegDecoder::new()?;

        let reader = {
            let latest = Arc::clone(&latest);
            let stop = Arc::clone(&stop);
            let url = url.to_string();
            thread::Builder::new()
                .name("mjpeg-reader".into())
                .spawn(move || read_loop(agent, url, body, decoder, &latest, &stop))?
        };

        Ok(Self {
            latest,
            stale_after: read_timeout,
            stop,
            _reader: reader,
        })
    }
}

fn read_loop(
    agent: ureq::Agent,
    url: String,
    mut body: Box<dyn Read + Send + Sync>,
    mut decoder: MjpegDecoder,
    latest: &LatestFrame,
    stop: &AtomicBool,
) {
    let mut splitter = JpegSplitter::default();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut decoded = 0u64;
    let mut reconnects = 0u32;

    while !stop.load(Ordering::Relaxed) {
        let n = match body.read(&mut chunk) {
            Ok(0) => {
                tracing::warn!(url, "MJPEG stream ended");
                0
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(url, error = %e, "MJPEG stream read failed");
                0
            }
        };

        if n == 0 {
            // Reconnect until it works or we are told to stop.
            body = loop {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                let delay = reconnect_delay(reconnects);
                thread::sleep(delay);
                reconnects = reconnects.saturating_add(1);
                match connect(&agent, &url) {
                    Ok(b) => {
                        tracing::info!(url, attempts = reconnects, "MJPEG stream reconnected");
                        reconnects = 0;
                        break b;
                    }
                    Err(e) => tracing::debug!(url, error = %e, "Reconnect failed"),
                }
            };
            splitter = JpegSplitter::default();
            continue;
        }

        let Some(jpeg) = splitter.push(&chunk[..n]) else {
            continue;
        };

        match decoder.decode_jpeg(&jpeg) {
            Ok(frame) => {
                *latest.lock().unwrap_or_else(|p| p.into_inner()) = Some((frame, Instant::now()));
                decoded += 1;
                if decoded.is_multiple_of(300) {
                    tracing::debug!(url, decoded, "MJPEG stream status");
                }
            }
            Err(e) => tracing::debug!(url, error = %e, "Dropping undecodable JPEG"),
        }
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let delay = Duration::from_millis(100u64.saturating_mul(1u64 << attempt.min(6)));
    delay.min(MAX_RECONNECT_DELAY)
}

impl FrameSource for StreamSource {
    fn next_frame(&mut self) -> Option<Frame> {
        let guard = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some((frame, at)) if at.elapsed() <= self.stale_after => Some(frame.clone()),
            _ => None,
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Stream
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        // The reader notices within one read timeout; it is not joined.
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::solid_jpeg;
    use std::io::Write;
    use std::net::TcpListener;

    /// Serve `body` once as a multipart MJPEG response, then hold the
    /// connection open so the reader doesn't reconnect during the test.
    fn serve_once(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 1024];
            let _ = conn.read(&mut request);
            let header = "HTTP/1.1 200 OK\r\n\
                          Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\r\n";
            conn.write_all(header.as_bytes()).unwrap();
            conn.write_all(&body).unwrap();
            conn.flush().unwrap();
            thread::sleep(Duration::from_secs(3));
        });
        format!("http://{addr}/stream")
    }

    fn wait_for(source: &mut StreamSource, pred: impl Fn(&Frame) -> bool) -> Option<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(frame) = source.next_frame()
                && pred(&frame)
            {
                return Some(frame);
            }
            thread::sleep(Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn test_unreachable_url_fails_at_open() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let result = StreamSource::open(
            &format!("http://127.0.0.1:{port}/stream"),
            Duration::from_millis(200),
        );
        assert!(matches!(result, Err(CaptureError::Open { .. })));
    }

    #[test]
    fn test_delivers_latest_frame_from_multipart_body() {
        let mut body = Vec::new();
        for shade in [10u8, 240u8] {
            body.extend(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend(solid_jpeg(16, 8, [shade, shade, shade]));
            body.extend(b"\r\n");
        }

        let url = serve_once(body);
        let mut source = StreamSource::open(&url, Duration::from_secs(2)).unwrap();
        assert_eq!(source.kind(), SourceKind::Stream);

        let frame = wait_for(&mut source, |f| f.pixels()[0] > 200)
            .expect("the newest (bright) frame within the deadline");
        assert_eq!(frame.size(), (16, 8));
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(reconnect_delay(2), Duration::from_millis(400));
        assert_eq!(reconnect_delay(30), MAX_RECONNECT_DELAY);
    }
}
