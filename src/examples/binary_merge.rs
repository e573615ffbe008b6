use ordmerge::*;
use std::thread;

/// Writes a CSR-like matrix dump: per row, column indices (ints) then values (floats).
///
/// Each rank owns a contiguous block of rows; the root's stream comes out in
/// global row order.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ordmerge=info".parse()?),
        )
        .init();

    let size = 4u32;
    let rows_per_rank = 8i64;
    let config = SessionConfig::binary(64, 64, 256).with_compression(128);
    let topologies = Topology::k_ary_group(size, 2)?;
    let transports = ChannelTransport::group(&topologies)?;

    println!("🧮 ordmerge binary dump - {size} ranks x {rows_per_rank} rows");

    let handles: Vec<_> = topologies
        .into_iter()
        .zip(transports)
        .map(|(topo, transport)| {
            let config = config.clone();
            thread::spawn(move || -> anyhow::Result<Option<Vec<u8>>> {
                let rank = topo.rank() as i64;
                let mut session = Session::open_with(topo, transport, config, || Ok(Vec::new()))?;

                // Two keys per row keep ints ahead of floats in the stream
                for row in rank * rows_per_rank..(rank + 1) * rows_per_rank {
                    let cols = [row - 1, row, row + 1];
                    let vals = [-1.0, 2.0, -1.0];
                    session.append_ints(&cols, Some(2 * row))?;
                    session.append_floats(&vals, Some(2 * row + 1))?;
                }
                Ok(session.close()?)
            })
        })
        .collect();

    let mut stream = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let out = handle
            .join()
            .map_err(|_| anyhow::anyhow!("rank {rank} panicked"))??;
        if out.is_some() {
            stream = out;
        }
    }

    let stream = stream.ok_or_else(|| anyhow::anyhow!("root returned no stream"))?;
    let hash = xxhash_rust::xxh3::xxh3_64(&stream);
    println!("✅ {} bytes, xxh3 {:#018x}", stream.len(), hash);
    Ok(())
}
