use ordmerge::*;
use rand::Rng;
use std::path::PathBuf;
use std::thread;

/// Runs a group of threads as an SPMD job writing one merged text file.
///
/// Usage: tree_merge [ranks] [fanout] [output]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ordmerge=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let size: u32 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(6);
    let fanout: u32 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(2);
    let path = args
        .get(3)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("tree_merge.txt"));

    println!("🌲 ordmerge - {size} ranks, fan-out {fanout}");
    println!("📄 Output: {}", path.display());

    let config = SessionConfig::text(256);
    let topologies = Topology::k_ary_group(size, fanout)?;
    let transports = ChannelTransport::group(&topologies)?;

    let handles: Vec<_> = topologies
        .into_iter()
        .zip(transports)
        .map(|(topo, transport)| {
            let path = path.clone();
            let config = config.clone();
            thread::spawn(move || -> anyhow::Result<SegmentStats> {
                let rank = topo.rank() as i64;
                let size = topo.size() as i64;
                let mut session = Session::open(&path, topo, transport, config)?;

                // Header line from every rank, in no particular order
                session.append(format!("# rank {rank} reporting\n").as_bytes())?;

                // Rows are dealt round-robin; each rank produces a random count of them
                let rows = rand::thread_rng().gen_range(5..20i64);
                for row in 0..rows {
                    let key = row * size + rank;
                    let value = (key as f64).sqrt();
                    session.append_tagged(format!("{key:6} {value:12.6}\n").as_bytes(), key)?;
                }
                let stats = session.sync()?;
                session.close()?;
                Ok(stats)
            })
        })
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        let stats = handle
            .join()
            .map_err(|_| anyhow::anyhow!("rank {rank} panicked"))??;
        println!(
            "   rank {rank}: {} rounds, {} chunks forwarded, {} written",
            stats.rounds, stats.chunks_forwarded, stats.chunks_written
        );
    }

    let written = std::fs::read_to_string(&path)?;
    println!("✅ {} lines written", written.lines().count());
    Ok(())
}
