/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod feed;
mod query;
mod report;
mod routes;
mod state;
mod subs;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use oneshot_core::blocklist::BlockList;
use oneshot_core::config::Config;
use oneshot_core::filter::FilterChain;
use oneshot_core::identity::IdentityDirectory;
use oneshot_core::jetstream::JetstreamListener;
use oneshot_core::keys::ServerKeys;
use oneshot_core::labels::{kind_mapping, LabelListener};
use oneshot_core::lang::build_detector;
use oneshot_core::notifier::BlockNotifier;
use oneshot_core::nsfw::{CostlyFilterChain, NsfwVisionFilter};
use oneshot_core::publish::publish_all;
use oneshot_core::session::XrpcClient;
use oneshot_core::store::Store;
use oneshot_core::watcher::AccountWatcher;

use state::AppState;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "oneshot-labeler", about = "Derived moderation labeler and feed generator")]
struct Args {
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
    /// Publish the labeler and feed generator records, then exit.
    #[arg(long)]
    publish: bool,
    /// Rebuild the block table from the persisted counters, then exit.
    #[arg(long)]
    rebuild: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap()),
        )
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let cfg = Config::from_env()?;
    let store = Store::open(&cfg.database_file)?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build http client")?;
    let directory = IdentityDirectory::new(http.clone());
    let keys = Arc::new(ServerKeys::load_or_generate(&store, &cfg.user_did)?);

    if args.publish {
        let client = tokio::time::timeout(
            STARTUP_TIMEOUT,
            XrpcClient::login(
                http.clone(),
                &directory,
                &cfg.username,
                &cfg.password,
                cfg.session_file.clone(),
            ),
        )
        .await
        .context("login timed out")??;
        return publish_all(&cfg, &client, &keys).await;
    }

    // Identity resolution and session refresh get one startup window.
    let (labeler, _client) = tokio::time::timeout(STARTUP_TIMEOUT, async {
        let labeler = directory.resolve_labeler(&cfg.upstream_user).await?;
        let client = XrpcClient::login(
            http.clone(),
            &directory,
            &cfg.username,
            &cfg.password,
            cfg.session_file.clone(),
        )
        .await?;
        Ok::<_, anyhow::Error>((labeler, client))
    })
    .await
    .context("startup timed out")??;
    info!(did = %labeler.did, endpoint = %labeler.endpoint, "resolved upstream labeler");

    let notifier = BlockNotifier::new(store.clone())?;
    let (watcher, candidates_tx, candidates_rx) = AccountWatcher::new(
        store.clone(),
        http.clone(),
        notifier.clone(),
        cfg.appview_rate_limit,
        cfg.offending_post_ratio,
    );
    let label_listener = LabelListener::new(
        store.clone(),
        labeler.endpoint.clone(),
        kind_mapping(&labeler.policies),
        cfg.profile_label_policy,
        candidates_tx,
    )?;

    if args.rebuild {
        let threshold = store.get_config_int("offender-threshold", cfg.offender_threshold)?;
        store.set_config_int("offender-threshold", threshold)?;
        label_listener.rebuild_blocks(threshold)?;
        return Ok(());
    }

    let block_list = BlockList::new(cfg.external_block_list.clone());
    let filters = FilterChain::standard(Arc::new(build_detector()));
    let costly = match &cfg.nsfw_filter {
        Some(nsfw) => CostlyFilterChain::new(Some(NsfwVisionFilter::new(
            http.clone(),
            nsfw.url.clone(),
            nsfw.nsfw_threshold,
            nsfw.min_diff,
            nsfw.max_conns,
        ))),
        None => CostlyFilterChain::none(),
    };
    let jetstream = JetstreamListener::new(
        store.clone(),
        notifier.clone(),
        block_list.clone(),
        filters,
        costly,
        cfg.jetstream_host.clone(),
    )?;
    {
        let jetstream = jetstream.clone();
        block_list.set_reload_notifier(move || jetstream.notify_list_updated());
    }

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            root.cancel();
        });
    }

    // Stopping the label listener stops the account watcher with it.
    let label_token = root.child_token();
    let watcher_token = label_token.child_token();

    let app_state = AppState {
        cfg: Arc::new(cfg.clone()),
        store: store.clone(),
        notifier: notifier.clone(),
        keys,
        directory,
        block_list: block_list.clone(),
        jetstream: jetstream.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let tcp = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("serving on http://{addr}");
    let server = {
        let root = root.clone();
        tokio::spawn(async move {
            let shutdown = async move { root.cancelled().await };
            if let Err(e) = axum::serve(tcp, routes::router(app_state).into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("http server error: {e}");
            }
        })
    };

    let tasks = vec![
        block_list.run(root.child_token()),
        label_listener.run(label_token),
        watcher.run(candidates_rx, watcher_token),
        jetstream.run(root.child_token()),
        server,
    ];

    // First task to stop (fatal error or signal) takes the rest down.
    let (first, _index, rest) = futures_util::future::select_all(tasks).await;
    if let Err(e) = first {
        error!("task failed: {e}");
    }
    root.cancel();
    notifier.close();
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, futures_util::future::join_all(rest)).await;
    info!("shutdown complete");
    Ok(())
}
