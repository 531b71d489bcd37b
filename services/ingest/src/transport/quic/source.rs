// Abstract envelope source so the read loop can be unit tested without a
// live QUIC stream.
use anyhow::Result;
use bytes::BytesMut;
use fleetline_wire::Envelope;
use quinn::RecvStream;
use std::future::Future;
use std::pin::Pin;

use super::codec::read_envelope_limited;

pub(crate) trait EnvelopeSource: Send {
    fn next_envelope<'a>(
        &'a mut self,
        max_frame_bytes: usize,
        scratch: &'a mut BytesMut,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Envelope>>> + Send + 'a>>;
}

impl EnvelopeSource for RecvStream {
    fn next_envelope<'a>(
        &'a mut self,
        max_frame_bytes: usize,
        scratch: &'a mut BytesMut,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Envelope>>> + Send + 'a>> {
        Box::pin(read_envelope_limited(self, max_frame_bytes, scratch))
    }
}

#[cfg(test)]
pub(crate) struct TestEnvelopeSource {
    pub(crate) envelopes: std::collections::VecDeque<Result<Option<Envelope>>>,
}

#[cfg(test)]
impl TestEnvelopeSource {
    pub(crate) fn new(envelopes: Vec<Result<Option<Envelope>>>) -> Self {
        Self {
            envelopes: envelopes.into(),
        }
    }
}

#[cfg(test)]
impl EnvelopeSource for TestEnvelopeSource {
    fn next_envelope<'a>(
        &'a mut self,
        _max_frame_bytes: usize,
        _scratch: &'a mut BytesMut,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Envelope>>> + Send + 'a>> {
        Box::pin(async move { self.envelopes.pop_front().unwrap_or_else(|| Ok(None)) })
    }
}

#[cfg(test)]
pub(crate) struct PendingEnvelopeSource;

#[cfg(test)]
impl EnvelopeSource for PendingEnvelopeSource {
    fn next_envelope<'a>(
        &'a mut self,
        _max_frame_bytes: usize,
        _scratch: &'a mut BytesMut,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Envelope>>> + Send + 'a>> {
        Box::pin(std::future::pending())
    }
}
