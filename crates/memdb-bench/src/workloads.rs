//! Benchmark workloads. Each logs its rate at `info` level.

use std::time::{Duration, Instant};

use anyhow::Context;
use memdb_autoconn::AutoConnection;
use memdb_core::{Change, UpdateOptions};
use serde_json::json;
use tokio::task::JoinSet;

const PLAYER: &str = "player";
const PLAYER_ID: &str = "1";

/// Operations per second.
fn rate(count: u64, elapsed: Duration) -> f64 {
    count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
}

async fn increment(pool: &AutoConnection, options: UpdateOptions) -> anyhow::Result<()> {
    let p = pool.clone();
    pool.transaction(move || async move {
        let players = p.current_collection(PLAYER)?;
        players
            .update(PLAYER_ID, Change::inc("exp", 1), options)
            .await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
}

pub async fn single_doc(pool: &AutoConnection, count: u64) -> anyhow::Result<()> {
    let p = pool.clone();
    pool.transaction(move || async move {
        let players = p.current_collection(PLAYER)?;
        players
            .insert(json!({"_id": 1, "name": "rain", "exp": 0}))
            .await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("seeding player document")?;

    let started = Instant::now();
    let mut failed = 0u64;
    for _ in 0..count {
        if let Err(err) = increment(pool, UpdateOptions::default()).await {
            failed += 1;
            tracing::error!(error = %err, "increment failed");
        }
    }
    tracing::info!(
        count = count,
        failed = failed,
        rate = rate(count, started.elapsed()),
        "single-doc done"
    );

    let p = pool.clone();
    let player = pool
        .transaction(move || async move {
            let players = p.current_collection(PLAYER)?;
            let doc = players.find(PLAYER_ID).await?;
            players.remove(PLAYER_ID).await?;
            Ok::<_, anyhow::Error>(doc)
        })
        .await?;
    tracing::info!(player = ?player, "final document");
    Ok(())
}

pub async fn one_transaction(pool: &AutoConnection, count: u64) -> anyhow::Result<()> {
    let started = Instant::now();
    let p = pool.clone();
    pool.transaction(move || async move {
        let players = p.current_collection(PLAYER)?;
        for _ in 0..count {
            players
                .update(PLAYER_ID, Change::inc("exp", 1), UpdateOptions::upsert())
                .await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    tracing::info!(
        count = count,
        rate = rate(count, started.elapsed()),
        "one-transaction done"
    );
    Ok(())
}

pub async fn huge_docs(pool: &AutoConnection, count: u64) -> anyhow::Result<()> {
    let started = Instant::now();
    let p = pool.clone();
    pool.transaction(move || async move {
        let players = p.current_collection(PLAYER)?;
        for id in 0..count {
            let change = Change::set(json!({"_id": id, "name": "rain", "exp": id}))?;
            players
                .update(&id.to_string(), change, UpdateOptions::upsert())
                .await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    let load = started.elapsed();

    let started = Instant::now();
    let p = pool.clone();
    pool.transaction(move || async move {
        p.current_persist_all().await?;
        Ok::<_, anyhow::Error>(())
    })
    .await?;
    tracing::info!(
        count = count,
        load_rate = rate(count, load),
        persist_ms = started.elapsed().as_millis() as u64,
        "huge-docs done"
    );
    Ok(())
}

pub async fn concurrent(
    pool: &AutoConnection,
    count: u64,
    requests_per_sec: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(requests_per_sec > 0, "--rate must be positive");
    let spacing = Duration::from_secs_f64(1.0 / requests_per_sec as f64);

    let started = Instant::now();
    let mut requests = JoinSet::new();
    for i in 0..count {
        let pool = pool.clone();
        let delay = spacing.mul_f64(i as f64);
        requests.spawn(async move {
            tokio::time::sleep(delay).await;
            let start = Instant::now();
            let result = increment(&pool, UpdateOptions::upsert()).await;
            (start.elapsed(), result)
        });
    }

    let mut response_total = Duration::ZERO;
    let mut failed = 0u64;
    while let Some(joined) = requests.join_next().await {
        let (elapsed, result) = joined?;
        response_total += elapsed;
        if let Err(err) = result {
            failed += 1;
            tracing::warn!(error = %err, "request failed");
        }
    }

    tracing::info!(
        count = count,
        failed = failed,
        rate = rate(count, started.elapsed()),
        mean_response_ms = response_total.as_secs_f64() * 1000.0 / count.max(1) as f64,
        "concurrent done"
    );
    Ok(())
}
