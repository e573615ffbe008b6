//! Helpers for running whole process groups as threads.

#![allow(dead_code)]

use std::thread;

use ordmerge::{ChannelTransport, Key, MergeError, Session, SessionConfig, Topology};

pub type TestSession = Session<ChannelTransport, Vec<u8>>;

pub struct GroupRun<R> {
    /// Everything the root wrote
    pub output: Vec<u8>,
    /// Per-rank results of the body, indexed by rank
    pub results: Vec<R>,
}

/// Open a session on every rank of a k-ary group, run `body`, close.
pub fn run_group<R, F>(size: u32, fanout: u32, config: SessionConfig, body: F) -> GroupRun<R>
where
    R: Send,
    F: Fn(&mut TestSession) -> R + Sync,
{
    let topologies = Topology::k_ary_group(size, fanout).expect("valid topology");
    let transports = ChannelTransport::group(&topologies).expect("transport group");

    thread::scope(|s| {
        let handles: Vec<_> = topologies
            .into_iter()
            .zip(transports)
            .map(|(topo, transport)| {
                let config = config.clone();
                let body = &body;
                s.spawn(move || {
                    let mut session = Session::open_with(topo, transport, config, || Ok(Vec::new()))
                        .expect("open should succeed");
                    let result = body(&mut session);
                    let output = session.close().expect("close should succeed");
                    (output, result)
                })
            })
            .collect();

        let mut output = None;
        let mut results = Vec::new();
        for handle in handles {
            let (out, result) = handle.join().expect("rank panicked");
            if out.is_some() {
                output = out;
            }
            results.push(result);
        }
        GroupRun {
            output: output.expect("root returns its stream"),
            results,
        }
    })
}

/// Open on every rank with a root sink that may fail; returns each rank's outcome
pub fn open_group(size: u32, fanout: u32, root_fails: bool) -> Vec<Result<(), MergeError>> {
    let topologies = Topology::k_ary_group(size, fanout).expect("valid topology");
    let transports = ChannelTransport::group(&topologies).expect("transport group");

    thread::scope(|s| {
        let handles: Vec<_> = topologies
            .into_iter()
            .zip(transports)
            .map(|(topo, transport)| {
                s.spawn(move || {
                    let opened = Session::open_with(topo, transport, SessionConfig::default(), || {
                        if root_fails {
                            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such dir"))
                        } else {
                            Ok(Vec::new())
                        }
                    });
                    opened.map(|_: TestSession| ())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Format a tagged text item
pub fn line(key: Key) -> Vec<u8> {
    format!("{key}\n").into_bytes()
}

pub fn lines(output: &[u8]) -> Vec<String> {
    String::from_utf8(output.to_vec())
        .expect("utf-8 output")
        .lines()
        .map(str::to_owned)
        .collect()
}

/// Parse every line of the output as a key
pub fn keys(output: &[u8]) -> Vec<Key> {
    lines(output)
        .iter()
        .map(|l| l.parse().expect("numeric line"))
        .collect()
}
