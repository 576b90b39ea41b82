//! Example web server streaming a scripted echo agent.
//!
//! Run with: cargo run -p agent-stream-web-server
//!
//! Then open http://localhost:3000 in your browser.
//!
//! Environment:
//! - `AGENT_STREAM_ADDR` - bind address (default `127.0.0.1:3000`)
//! - `AGENT_STREAM_CONFIG` - optional JSON file with broker settings
//! - `RUST_LOG` - log filter (default `info`)

use std::{net::SocketAddr, sync::Arc, time::Duration};

use agent_stream_core::{AgentClient, TranscriptStore};
use agent_stream_session::{
    BrokerConfig, ScriptStep, ScriptedAgent, SessionBroker, storage::MemoryTranscriptStore,
};
use anyhow::Context;
use axum::{response::Html, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    tracing::info!(?config, "broker configured");

    let store = Arc::new(MemoryTranscriptStore::new());
    let broker = SessionBroker::new(
        config,
        Arc::new(echo_agent()) as Arc<dyn AgentClient>,
        Arc::clone(&store) as Arc<dyn TranscriptStore>,
    )
    .with_recorder(store);

    let app = agent_stream_transport::create_router(Arc::new(broker))
        .route("/", get(index_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = std::env::var("AGENT_STREAM_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".into())
        .parse()
        .context("AGENT_STREAM_ADDR is not a socket address")?;
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config() -> anyhow::Result<BrokerConfig> {
    let Ok(path) = std::env::var("AGENT_STREAM_CONFIG") else {
        return Ok(BrokerConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

/// Echoes the prompt word by word, taking input for a few seconds in between.
fn echo_agent() -> ScriptedAgent {
    ScriptedAgent::from_fn(|prompt| {
        let mut steps = vec![ScriptStep::text("echo:")];
        for word in prompt.split_whitespace() {
            steps.push(ScriptStep::Pause(Duration::from_millis(250)));
            steps.push(ScriptStep::text(format!(" {word}")));
        }
        steps.push(ScriptStep::AwaitInput(Duration::from_secs(3)));
        steps
    })
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Agent Stream</title>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        #log {
            white-space: pre-wrap;
            font-family: Menlo, Monaco, "Courier New", monospace;
            height: calc(100vh - 180px);
            overflow-y: auto;
        }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .meta { color: #888; }
        .warn { color: #cc4; }
        .error { color: #a44; }
        .user { color: #4a4; }
        input { width: 60%; }
    </style>
</head>
<body>
    <h1>Agent Stream</h1>
    <div class="status" id="status">Idle</div>
    <form id="form">
        <input id="input" placeholder="Prompt, or a message for the running turn" />
        <button>Send</button>
        <button type="button" id="abort">Abort</button>
    </form>
    <div id="log"></div>

    <script>
        const log = document.getElementById('log');
        const status = document.getElementById('status');
        let sessionId = null;
        let lastSeen = 0;
        let source = null;

        function line(text, cls) {
            const span = document.createElement('span');
            span.textContent = text;
            if (cls) span.className = cls;
            log.appendChild(span);
            log.scrollTop = log.scrollHeight;
        }

        function follow() {
            source = new EventSource(`/sessions/${sessionId}/events?after=${lastSeen}`);
            status.textContent = `Streaming ${sessionId}`;
            const handlers = {
                'text-delta': (e) => line(e.text),
                'userMessage': (e) => line(`\n> ${e.content}\n`, 'user'),
                'sessionActivated': (e) => { sessionId = e.sessionId; },
                'warning': (e) => line(`\n[warning] ${e.message}\n`, 'warn'),
                'typedError': (e) => line(`\n[error] ${e.message}\n`, 'error'),
                'aborted': (e) => line(`\n[aborted: ${e.reason}]\n`, 'meta'),
                'done': () => line('\n[done]\n', 'meta'),
            };
            for (const [type, handle] of Object.entries(handlers)) {
                source.addEventListener(type, (msg) => {
                    const event = JSON.parse(msg.data);
                    lastSeen = event.sequence;
                    handle(event);
                    if (['done', 'typedError', 'aborted'].includes(type)) finish();
                });
            }
            source.addEventListener('unavailable', () => {
                line('\n[session state unknown]\n', 'meta');
                finish();
            });
        }

        function finish() {
            source.close();
            sessionId = null;
            status.textContent = 'Idle';
        }

        async function post(path, body) {
            return fetch(path, {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify(body),
            });
        }

        async function startTurn(prompt) {
            const res = await post('/sessions', { prompt });
            if (!res.ok) {
                line(`\n[error] ${(await res.json()).message}\n`, 'error');
                return;
            }
            sessionId = (await res.json()).sessionId;
            lastSeen = 0;
            line(`\n> ${prompt}\n`, 'user');
            follow();
        }

        document.getElementById('form').addEventListener('submit', async (e) => {
            e.preventDefault();
            const input = document.getElementById('input');
            const text = input.value.trim();
            input.value = '';
            if (!text) return;
            if (!sessionId) return startTurn(text);

            const res = await post(`/sessions/${sessionId}/inject`, { message: text });
            if (!res.ok) {
                const body = await res.json();
                if (body.resendAsNewTurn) return startTurn(text);
                line(`\n[error] ${body.message}\n`, 'error');
            }
        });

        document.getElementById('abort').addEventListener('click', () => {
            if (sessionId) fetch(`/sessions/${sessionId}/abort`, { method: 'POST' });
        });
    </script>
</body>
</html>
"#;
