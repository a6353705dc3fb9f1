//! One inbound proxy exchange
//!
//! The listener wraps every request in a [`Session`] and hands it to the
//! active engine. The engine answers through the session's responder; the
//! listener waits on the matching receiver and writes whatever arrives back
//! to the client.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::sync::oneshot;

pub type ProxyResponse = Response<Full<Bytes>>;

/// An inbound request together with the channel its response goes back on
pub struct Session<B = Incoming> {
    request: Request<B>,
    client_ip: String,
    responder: Responder,
}

/// Sends the response for exactly one session
pub struct Responder(oneshot::Sender<ProxyResponse>);

impl<B> Session<B> {
    pub fn new(request: Request<B>, client_ip: String) -> (Self, oneshot::Receiver<ProxyResponse>) {
        let (tx, rx) = oneshot::channel();
        let session = Self {
            request,
            client_ip,
            responder: Responder(tx),
        };
        (session, rx)
    }

    pub fn request(&self) -> &Request<B> {
        &self.request
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn into_parts(self) -> (Request<B>, String, Responder) {
        (self.request, self.client_ip, self.responder)
    }
}

impl Responder {
    pub fn send(self, response: ProxyResponse) {
        // The listener only goes away when the client connection does.
        let _ = self.0.send(response);
    }

    pub fn error(self, status: StatusCode, message: &str) {
        self.send(error_response(status, message));
    }
}

/// Create a plain-text error response
pub fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_session_delivers_response() {
        let request = Request::builder()
            .uri("http://example.com/")
            .body(())
            .unwrap();
        let (session, rx) = Session::new(request, "10.0.0.1".to_string());
        assert_eq!(session.client_ip(), "10.0.0.1");
        assert_eq!(session.request().uri(), "http://example.com/");

        let (_, _, responder) = session.into_parts();
        responder.error(StatusCode::BAD_GATEWAY, "upstream gone");

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], "text/plain");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"upstream gone");
    }

    #[tokio::test]
    async fn test_dropped_session_closes_receiver() {
        let request = Request::builder().uri("/").body(()).unwrap();
        let (session, rx) = Session::new(request, "10.0.0.1".to_string());
        drop(session);
        assert!(rx.await.is_err());
    }
}
