// Incremental response assembly for one stream: headers once, body chunks
// in receipt order, optional trailers, exactly one terminal signal.
use bytes::{Bytes, BytesMut};
use strand_types::{
    FALLBACK_STATUS, HeaderFields, HeaderTranslationError, Response, parse_status,
};
use tracing::warn;

/// Outcome of applying one event to the response under construction.
#[derive(Debug)]
pub(crate) enum AssemblyStep {
    Incomplete,
    Complete(Response),
}

/// Builds a [`Response`] from the per-stream event sequence. Events for
/// one stream arrive in receipt order on the connection driver, so no
/// reordering happens here.
#[derive(Debug, Default)]
pub(crate) struct ResponseAssembler {
    status: Option<u16>,
    headers: HeaderFields,
    body: BytesMut,
    trailers: HeaderFields,
    has_head: bool,
}

impl ResponseAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply a header block. The first block is the response head; any
    /// later block is trailers. A block flagged final terminates the
    /// stream (trailer-only termination implies an empty final chunk).
    pub(crate) fn on_headers(
        &mut self,
        fields: HeaderFields,
        end_stream: bool,
    ) -> Result<AssemblyStep, HeaderTranslationError> {
        if self.has_head {
            self.apply_trailers(fields)?;
            if !end_stream {
                // Only a block flagged final terminates the stream.
                warn!("trailer block without final flag, stream stays open");
                return Ok(AssemblyStep::Incomplete);
            }
            return Ok(AssemblyStep::Complete(self.finish()));
        }

        self.has_head = true;
        match parse_status(&fields) {
            Ok(status) => self.status = Some(status),
            Err(err) => {
                // Degraded but delivered: substitute the fallback status
                // rather than dropping the response.
                warn!(%err, fallback = FALLBACK_STATUS, "substituting fallback status");
                self.status = Some(FALLBACK_STATUS);
            }
        }
        for (name, value) in fields {
            if name == ":status" {
                continue;
            }
            if name.starts_with(':') {
                return Err(HeaderTranslationError {
                    reason: format!("unknown pseudo-header field {name:?} in response"),
                });
            }
            self.headers.push((name, value));
        }

        if end_stream {
            Ok(AssemblyStep::Complete(self.finish()))
        } else {
            Ok(AssemblyStep::Incomplete)
        }
    }

    /// Append a body chunk in arrival order.
    pub(crate) fn on_data(&mut self, data: Bytes, end_stream: bool) -> AssemblyStep {
        self.body.extend_from_slice(&data);
        if end_stream {
            AssemblyStep::Complete(self.finish())
        } else {
            AssemblyStep::Incomplete
        }
    }

    fn apply_trailers(&mut self, fields: HeaderFields) -> Result<(), HeaderTranslationError> {
        for (name, value) in fields {
            if name.starts_with(':') {
                return Err(HeaderTranslationError {
                    reason: format!("pseudo-header field {name:?} in trailers"),
                });
            }
            self.trailers.push((name, value));
        }
        Ok(())
    }

    fn finish(&mut self) -> Response {
        Response {
            status: self.status.take().unwrap_or(FALLBACK_STATUS),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body).freeze(),
            trailers: std::mem::take(&mut self.trailers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HeaderFields {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn headers_then_chunks_then_final() {
        let mut assembler = ResponseAssembler::new();
        let step = assembler
            .on_headers(fields(&[(":status", "200"), ("server", "strand")]), false)
            .unwrap();
        assert!(matches!(step, AssemblyStep::Incomplete));

        assert!(matches!(
            assembler.on_data(Bytes::from_static(b"ab"), false),
            AssemblyStep::Incomplete
        ));
        match assembler.on_data(Bytes::from_static(b"cd"), true) {
            AssemblyStep::Complete(response) => {
                assert_eq!(response.status, 200);
                assert_eq!(response.header("server"), Some("strand"));
                assert_eq!(&response.body[..], b"abcd");
                assert!(response.trailers.is_empty());
            }
            AssemblyStep::Incomplete => panic!("expected completion"),
        }
    }

    #[test]
    fn headers_only_response_completes_immediately() {
        let mut assembler = ResponseAssembler::new();
        match assembler.on_headers(fields(&[(":status", "304")]), true).unwrap() {
            AssemblyStep::Complete(response) => {
                assert_eq!(response.status, 304);
                assert!(response.body.is_empty());
            }
            AssemblyStep::Incomplete => panic!("expected completion"),
        }
    }

    #[test]
    fn trailer_only_termination() {
        let mut assembler = ResponseAssembler::new();
        assembler
            .on_headers(fields(&[(":status", "200")]), false)
            .unwrap();
        assembler.on_data(Bytes::from_static(b"payload"), false);
        match assembler
            .on_headers(fields(&[("grpc-status", "0")]), true)
            .unwrap()
        {
            AssemblyStep::Complete(response) => {
                assert_eq!(&response.body[..], b"payload");
                assert_eq!(response.trailer("grpc-status"), Some("0"));
            }
            AssemblyStep::Incomplete => panic!("expected completion"),
        }
    }

    #[test]
    fn non_final_trailer_block_does_not_terminate() {
        let mut assembler = ResponseAssembler::new();
        assembler
            .on_headers(fields(&[(":status", "200")]), false)
            .unwrap();
        assembler.on_data(Bytes::from_static(b"pay"), false);

        let step = assembler
            .on_headers(fields(&[("grpc-status", "0")]), false)
            .unwrap();
        assert!(matches!(step, AssemblyStep::Incomplete));

        match assembler.on_data(Bytes::from_static(b"load"), true) {
            AssemblyStep::Complete(response) => {
                assert_eq!(&response.body[..], b"payload");
                assert_eq!(response.trailer("grpc-status"), Some("0"));
            }
            AssemblyStep::Incomplete => panic!("expected completion"),
        }
    }

    #[test]
    fn unparseable_status_degrades_to_fallback() {
        let mut assembler = ResponseAssembler::new();
        match assembler
            .on_headers(fields(&[(":status", "teapot"), ("x", "y")]), true)
            .unwrap()
        {
            AssemblyStep::Complete(response) => {
                assert_eq!(response.status, FALLBACK_STATUS);
                assert_eq!(response.header("x"), Some("y"));
            }
            AssemblyStep::Incomplete => panic!("expected completion"),
        }
    }

    #[test]
    fn pseudo_header_in_response_is_translation_failure() {
        let mut assembler = ResponseAssembler::new();
        let err = assembler
            .on_headers(fields(&[(":status", "200"), (":bogus", "1")]), false)
            .unwrap_err();
        assert!(err.reason.contains(":bogus"));
    }

    #[test]
    fn pseudo_header_in_trailers_is_translation_failure() {
        let mut assembler = ResponseAssembler::new();
        assembler
            .on_headers(fields(&[(":status", "200")]), false)
            .unwrap();
        let err = assembler
            .on_headers(fields(&[(":status", "200")]), true)
            .unwrap_err();
        assert!(err.reason.contains(":status"));
    }
}
