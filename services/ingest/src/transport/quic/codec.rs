// Envelope reading and writing over QUIC streams, with a size cap enforced
// before the body is buffered.
use anyhow::{Context, Result};
use bytes::BytesMut;
use fleetline_wire::{Envelope, LEN_PREFIX};
use quinn::{ReadExactError, RecvStream, SendStream};

/// Read one envelope. `Ok(None)` means the peer finished the stream
/// cleanly before the next frame.
pub async fn read_envelope_limited(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Envelope>> {
    let mut len_bytes = [0u8; LEN_PREFIX];
    match recv.read_exact(&mut len_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }

    let body_len = u32::from_be_bytes(len_bytes) as usize;
    if body_len > max_frame_bytes {
        return Err(fleetline_wire::Error::FrameTooLarge(body_len))
            .with_context(|| format!("max_frame_bytes is {max_frame_bytes}"));
    }
    scratch.clear();
    scratch.resize(body_len, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame body")?;
    let envelope =
        Envelope::decode_body(scratch.split().freeze()).context("decode envelope body")?;
    Ok(Some(envelope))
}

pub async fn write_envelope(send: &mut SendStream, envelope: &Envelope) -> Result<()> {
    let frame = envelope.encode();
    send.write_all(&frame).await.context("write frame")?;
    Ok(())
}
