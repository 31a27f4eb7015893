//! Simple example of using reqwest-probe-pool.
//!
//! Proxies come from the lists named in `PROXY_LISTS` (comma separated URLs
//! or files), or from Webshare when `WEBSHARE_API_KEY`, `PROXY_USER` and
//! `PROXY_PASS` are set. Candidates are read from the command line.

use reqwest_probe_pool::{
    ChannelSink, HttpProber, ListSource, ProbeEngine, ProbeEngineConfig, ProxyPool,
    ProxyPoolConfig, ProxySource, QueueCandidates, WebshareSource,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let source: Arc<dyn ProxySource> = match (
        std::env::var("WEBSHARE_API_KEY"),
        std::env::var("PROXY_USER"),
        std::env::var("PROXY_PASS"),
    ) {
        (Ok(key), Ok(user), Ok(pass)) => Arc::new(WebshareSource::new(key, user, pass)),
        _ => {
            let lists = std::env::var("PROXY_LISTS").unwrap_or_else(|_| {
                "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt"
                    .to_string()
            });
            Arc::new(ListSource::new(lists.split(',').map(str::trim).collect::<Vec<&str>>()))
        }
    };

    let pool = Arc::new(ProxyPool::new(
        ProxyPoolConfig::builder()
            .min_size(10)
            .max_size(50)
            .cooldown(Duration::from_secs(10))
            .build(),
    ));

    let target = std::env::var("PROBE_TARGET").unwrap_or_else(|_| "https://kick.com/{}".to_string());
    let prober = Arc::new(HttpProber::new(target));

    let engine = ProbeEngine::new(
        ProbeEngineConfig::builder()
            .concurrency(5)
            .max_attempts(3)
            .probe_timeout(Duration::from_secs(10))
            .build(),
        Arc::clone(&pool),
        source,
        prober,
    );

    let candidates = Arc::new(QueueCandidates::from_list(std::env::args().skip(1)));
    let (sink, mut reports) = ChannelSink::new(64);

    let printer = tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            println!(
                "{:<20} {:<14} attempts={} latency={:?}",
                report.candidate,
                report.outcome.signal().to_string(),
                report.attempts,
                report.latency
            );
        }
    });

    let handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    let summary = engine.run(candidates.clone(), Arc::new(sink)).await;
    printer.await?;

    println!("{:?}", summary);
    println!("Unfinished candidates: {:?}", candidates.drain());
    println!("Good proxies: {}", pool.good_addresses().len());
    for (i, proxy) in pool.leaderboard(10).iter().enumerate() {
        println!(
            "{}. {} hits={} avg={:?} health={:.1}%",
            i + 1,
            proxy.display_address(),
            proxy.successes,
            proxy.avg_latency(),
            proxy.health_pct()
        );
    }

    Ok(())
}
