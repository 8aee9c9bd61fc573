//! Fetching and serving content-addressed refs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use weft_base::RefId;

use crate::refstore::RefStore;
use crate::transport::{Peer, PeerStream, Transport, REF_CHUNK_SIZE};
use crate::Result;

/// Deadline for re-announcing freshly stored refs.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer between the wire and the store while a ref streams in.
const FETCH_PIPE_CAP: usize = 64 * 1024;

/// Try each provider in turn until one delivers a blob whose hashes match
/// the requested id.
///
/// Returns whether the ref was stored. On `false` the ref stays on the
/// store's needed list and the periodic tick retries it.
pub(crate) async fn fetch_ref(
    mut providers: PeerStream,
    ref_store: &Arc<dyn RefStore>,
    transports: &[Arc<dyn Transport>],
    ref_id: RefId,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let peer = tokio::select! {
            _ = cancel.cancelled() => return false,
            peer = providers.next() => match peer {
                Some(peer) => peer,
                None => return false,
            },
        };

        match fetch_ref_from_peer(&peer, ref_store, ref_id).await {
            Ok((sha1, sha3)) => {
                if sha1 != ref_id && sha3 != ref_id {
                    warn!(
                        %ref_id, peer = %peer.dial_info(),
                        "stored object does not hash to the requested ref; discarding"
                    );
                    continue;
                }
                announce_refs(transports, &[sha1, sha3]).await;
                return true;
            }
            Err(err) => {
                debug!(%ref_id, peer = %peer.dial_info(), %err, "fetching ref from peer failed");
            }
        }
    }
}

async fn fetch_ref_from_peer(
    peer: &Arc<dyn Peer>,
    ref_store: &Arc<dyn RefStore>,
    ref_id: RefId,
) -> Result<(RefId, RefId)> {
    peer.ensure_connected().await?;
    peer.fetch_ref(ref_id).await?;

    // The header carries nothing yet.
    peer.receive_ref_header().await?;

    let (mut pipe_wr, pipe_rd) = tokio::io::duplex(FETCH_PIPE_CAP);
    let pump_peer = peer.clone();
    let pump = tokio::spawn(async move {
        loop {
            let pkt = pump_peer.receive_ref_packet().await?;
            if pkt.end {
                return Ok::<_, crate::Error>(());
            }
            pipe_wr
                .write_all(&pkt.data)
                .await
                .map_err(|err| crate::Error::connection(err.to_string()))?;
        }
    });

    let stored = ref_store.store_object(Box::new(pipe_rd)).await;
    match pump.await {
        Ok(Ok(())) => {}
        // A truncated stream leaves the store with a short object whose
        // hashes cannot match; surface the transfer error instead.
        Ok(Err(err)) => return Err(err),
        Err(err) => return Err(crate::Error::connection(err.to_string())),
    }
    stored
}

/// Announce refs on every transport, ignoring the ones that do not support
/// announcements. Bounded by [`ANNOUNCE_TIMEOUT`].
pub(crate) async fn announce_refs(transports: &[Arc<dyn Transport>], ref_ids: &[RefId]) {
    let announces = transports.iter().flat_map(|transport| {
        ref_ids.iter().map(move |ref_id| {
            let transport = transport.clone();
            let ref_id = *ref_id;
            async move {
                match transport.announce_ref(ref_id).await {
                    Ok(()) => {}
                    Err(err) if err.is_unimplemented() => {}
                    Err(err) => {
                        warn!(%ref_id, transport = transport.name(), %err, "announcing ref failed")
                    }
                }
            }
        })
    });
    let _ = tokio::time::timeout(ANNOUNCE_TIMEOUT, futures::future::join_all(announces)).await;
}

/// Stream a stored ref to a peer in [`REF_CHUNK_SIZE`] packets, terminated
/// by an empty end-flagged packet. The peer handle is closed afterwards
/// whether or not the full stream was delivered.
pub(crate) async fn serve_ref(ref_store: &Arc<dyn RefStore>, ref_id: RefId, peer: Arc<dyn Peer>) {
    if let Err(err) = serve_ref_inner(ref_store, ref_id, &peer).await {
        error!(%ref_id, peer = %peer.dial_info(), %err, "serving ref failed");
    }
    let _ = peer.close().await;
}

async fn serve_ref_inner(
    ref_store: &Arc<dyn RefStore>,
    ref_id: RefId,
    peer: &Arc<dyn Peer>,
) -> Result<()> {
    let (mut object, _size) = ref_store.object(ref_id).await?;
    peer.send_ref_header().await?;

    let mut buf = vec![0u8; REF_CHUNK_SIZE];
    loop {
        let n = read_full(&mut object, &mut buf).await?;
        if n == 0 {
            break;
        }
        peer.send_ref_packet(Bytes::copy_from_slice(&buf[..n]), false)
            .await?;
        if n < REF_CHUNK_SIZE {
            break;
        }
    }
    peer.send_ref_packet(Bytes::new(), true).await?;
    Ok(())
}

/// Fill `buf` from `reader`, stopping early only at end of stream. Returns
/// the number of bytes read.
async fn read_full(reader: &mut (impl AsyncRead + Unpin + ?Sized), buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|err| crate::Error::connection(err.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
