use tracing::trace;

use crate::error::{FrameError, MergeError, Result};
use crate::topology::Topology;
use crate::transport::Transport;
use crate::{Frame, MsgType};

/// Worst-case (maximum) of `value` across the whole group.
///
/// Collective: every process must call it at the same protocol step.
pub fn all_reduce_max<T: Transport>(topology: &Topology, transport: &mut T, value: u8) -> Result<u8> {
    let rank = topology.rank();
    let mut acc = value;
    for index in 0..topology.fanout() {
        let frame = Frame::decode(&transport.recv_from_child(index)?)?;
        acc = acc.max(reduce_value(topology, &frame, "gathering a reduction")?);
    }
    if !topology.is_root() {
        transport.send_to_parent(Frame::reduce(rank, acc).encode(None)?)?;
        let frame = Frame::decode(&transport.recv_from_parent()?)?;
        acc = reduce_value(topology, &frame, "awaiting a reduction result")?;
    }
    for index in 0..topology.fanout() {
        transport.send_to_child(index, Frame::reduce(rank, acc).encode(None)?)?;
    }
    trace!(rank, value, result = acc, "reduction complete");
    Ok(acc)
}

/// True only if `ok` holds on every process
pub fn all_agree<T: Transport>(topology: &Topology, transport: &mut T, ok: bool) -> Result<bool> {
    Ok(all_reduce_max(topology, transport, u8::from(!ok))? == 0)
}

fn reduce_value(topology: &Topology, frame: &Frame, expected: &'static str) -> Result<u8> {
    match frame.reduce_value() {
        Some(value) => Ok(value),
        None if frame.hdr.mtype == MsgType::Reduce => Err(FrameError::PayloadMismatch { len: 0 }.into()),
        None => Err(MergeError::UnexpectedMessage {
            rank: topology.rank(),
            got: frame.hdr.mtype.name(),
            expected,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::transport::ChannelTransport;

    #[test]
    fn max_reaches_every_rank() {
        let topologies = Topology::k_ary_group(7, 2).unwrap();
        let transports = ChannelTransport::group(&topologies).unwrap();

        let handles: Vec<_> = topologies
            .into_iter()
            .zip(transports)
            .map(|(topo, mut transport)| {
                thread::spawn(move || {
                    let value = if topo.rank() == 5 { 9 } else { topo.rank() as u8 };
                    all_reduce_max(&topo, &mut transport, value).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 9);
        }
    }

    #[test]
    fn single_failure_is_seen_everywhere() {
        let topologies = Topology::k_ary_group(3, 2).unwrap();
        let transports = ChannelTransport::group(&topologies).unwrap();

        let handles: Vec<_> = topologies
            .into_iter()
            .zip(transports)
            .map(|(topo, mut transport)| {
                thread::spawn(move || all_agree(&topo, &mut transport, topo.rank() != 0).unwrap())
            })
            .collect();

        for handle in handles {
            assert!(!handle.join().unwrap());
        }
    }

    #[test]
    fn solo_reduction_needs_no_transport() {
        let topo = Topology::k_ary(0, 1, 2).unwrap();
        let mut transport = ChannelTransport::group(std::slice::from_ref(&topo))
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(all_reduce_max(&topo, &mut transport, 4).unwrap(), 4);
    }
}
