use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{MergeError, Result, TransportError};
use crate::topology::{Rank, Topology};

/// Blocking tree transport carrying encoded frames.
///
/// Child indices follow [`Topology::children`].
pub trait Transport {
    fn send_to_parent(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    fn recv_from_child(&mut self, index: usize) -> Result<Vec<u8>, TransportError>;

    fn send_to_child(&mut self, index: usize, frame: Vec<u8>) -> Result<(), TransportError>;

    fn recv_from_parent(&mut self) -> Result<Vec<u8>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_to_parent(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        (**self).send_to_parent(frame)
    }

    fn recv_from_child(&mut self, index: usize) -> Result<Vec<u8>, TransportError> {
        (**self).recv_from_child(index)
    }

    fn send_to_child(&mut self, index: usize, frame: Vec<u8>) -> Result<(), TransportError> {
        (**self).send_to_child(index, frame)
    }

    fn recv_from_parent(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).recv_from_parent()
    }
}

/// One end of a tree edge
#[derive(Debug)]
struct Link {
    peer: Rank,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// In-process transport endpoint backed by crossbeam channels
#[derive(Debug)]
pub struct ChannelTransport {
    rank: Rank,
    parent: Option<Link>,
    children: Vec<Link>,
}

impl ChannelTransport {
    /// Wire up endpoints for every rank of a group.
    ///
    /// `topologies[r]` must describe rank `r`, and every parent/child pair
    /// must agree with each other.
    pub fn group(topologies: &[Topology]) -> Result<Vec<ChannelTransport>> {
        let mut parents: Vec<Option<Link>> = topologies.iter().map(|_| None).collect();
        let mut endpoints = Vec::with_capacity(topologies.len());

        for (index, topo) in topologies.iter().enumerate() {
            if topo.rank() as usize != index || topo.size() as usize != topologies.len() {
                return Err(MergeError::InvalidTopology(format!(
                    "topology at index {index} describes rank {} of {}",
                    topo.rank(),
                    topo.size()
                )));
            }
            let mut children = Vec::with_capacity(topo.fanout());
            for &child in topo.children() {
                if topologies[child as usize].parent() != Some(topo.rank()) {
                    return Err(MergeError::InvalidTopology(format!(
                        "rank {child} does not list {} as its parent",
                        topo.rank()
                    )));
                }
                let (up_tx, up_rx) = unbounded();
                let (down_tx, down_rx) = unbounded();
                children.push(Link {
                    peer: child,
                    tx: down_tx,
                    rx: up_rx,
                });
                parents[child as usize] = Some(Link {
                    peer: topo.rank(),
                    tx: up_tx,
                    rx: down_rx,
                });
            }
            endpoints.push((topo.rank(), children));
        }

        endpoints
            .into_iter()
            .zip(parents)
            .zip(topologies)
            .map(|(((rank, children), parent), topo)| {
                if parent.is_none() && !topo.is_root() {
                    return Err(MergeError::InvalidTopology(format!(
                        "rank {rank} is not listed as a child of its parent"
                    )));
                }
                Ok(ChannelTransport {
                    rank,
                    parent,
                    children,
                })
            })
            .collect()
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    fn parent(&self) -> Result<&Link, TransportError> {
        self.parent
            .as_ref()
            .ok_or(TransportError::NoParent { rank: self.rank })
    }

    fn child(&self, index: usize) -> Result<&Link, TransportError> {
        self.children.get(index).ok_or(TransportError::NoSuchChild {
            rank: self.rank,
            index,
        })
    }
}

impl Transport for ChannelTransport {
    fn send_to_parent(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let link = self.parent()?;
        link.tx
            .send(frame)
            .map_err(|_| TransportError::Disconnected { peer: link.peer })
    }

    fn recv_from_child(&mut self, index: usize) -> Result<Vec<u8>, TransportError> {
        let link = self.child(index)?;
        link.rx
            .recv()
            .map_err(|_| TransportError::Disconnected { peer: link.peer })
    }

    fn send_to_child(&mut self, index: usize, frame: Vec<u8>) -> Result<(), TransportError> {
        let link = self.child(index)?;
        link.tx
            .send(frame)
            .map_err(|_| TransportError::Disconnected { peer: link.peer })
    }

    fn recv_from_parent(&mut self) -> Result<Vec<u8>, TransportError> {
        let link = self.parent()?;
        link.rx
            .recv()
            .map_err(|_| TransportError::Disconnected { peer: link.peer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_connect_both_ways() {
        let topologies = Topology::k_ary_group(4, 2).unwrap();
        let mut group = ChannelTransport::group(&topologies).unwrap();

        group[3].send_to_parent(b"up".to_vec()).unwrap();
        assert_eq!(group[1].recv_from_child(0).unwrap(), b"up");

        group[0].send_to_child(1, b"down".to_vec()).unwrap();
        assert_eq!(group[2].recv_from_parent().unwrap(), b"down");
    }

    #[test]
    fn misuse_is_reported() {
        let topologies = Topology::k_ary_group(2, 2).unwrap();
        let mut group = ChannelTransport::group(&topologies).unwrap();
        assert_eq!(
            group[0].send_to_parent(vec![]),
            Err(TransportError::NoParent { rank: 0 })
        );
        assert_eq!(
            group[1].recv_from_child(0),
            Err(TransportError::NoSuchChild { rank: 1, index: 0 })
        );

        let leaf = group.pop().unwrap();
        drop(leaf);
        assert_eq!(
            group[0].recv_from_child(0),
            Err(TransportError::Disconnected { peer: 1 })
        );
    }

    #[test]
    fn mismatched_group_is_rejected() {
        let mut topologies = Topology::k_ary_group(3, 2).unwrap();
        topologies.swap(1, 2);
        assert!(ChannelTransport::group(&topologies).is_err());
    }
}
