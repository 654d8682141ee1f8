use axum::response::IntoResponse;
use maud::{DOCTYPE, PreEscaped, html};

const CSS: &str = r#"
body { font-family: system-ui, sans-serif; background: #111827; color: #e5e7eb; margin: 0; }
main { max-width: 48rem; margin: 0 auto; padding: 1.5rem; }
input, button { font: inherit; padding: 0.4rem 0.6rem; border-radius: 0.25rem; border: 1px solid #374151; }
input { background: #1f2937; color: inherit; }
button { background: #2563eb; color: white; cursor: pointer; }
button:disabled { opacity: 0.5; cursor: default; }
.row { display: flex; gap: 0.5rem; margin-bottom: 0.75rem; }
.row input { flex: 1; }
#messages { height: 24rem; overflow-y: auto; background: #1f2937; border-radius: 0.25rem; padding: 0.5rem; }
.message { padding: 0.3rem 0.5rem; border-bottom: 1px solid #374151; white-space: pre-wrap; }
#status { color: #9ca3af; font-size: 0.875rem; margin-bottom: 0.75rem; }
"#;

const SCRIPT: &str = r#"
var ws = null;

function connect() {
    var username = document.getElementById('username').value.trim();
    if (!username) {
        alert('Enter a username');
        return;
    }
    if (ws) {
        ws.close();
    }

    var scheme = location.protocol === 'https:' ? 'wss' : 'ws';
    ws = new WebSocket(scheme + '://' + location.host + '/ws/' + encodeURIComponent(username));

    ws.onopen = function() {
        document.getElementById('status').textContent = 'Connected as ' + username;
        document.getElementById('connectBtn').disabled = true;
    };
    ws.onmessage = function(event) {
        var messages = document.getElementById('messages');
        var message = document.createElement('div');
        message.className = 'message';
        message.appendChild(document.createTextNode(event.data));
        messages.appendChild(message);
        messages.scrollTop = messages.scrollHeight;
    };
    ws.onclose = function() {
        document.getElementById('status').textContent = 'Disconnected';
        document.getElementById('connectBtn').disabled = false;
    };
    ws.onerror = function(e) {
        console.error('WebSocket error', e);
    };
}

function sendMessage() {
    if (!ws || ws.readyState !== WebSocket.OPEN) {
        alert('Not connected');
        return;
    }
    var input = document.getElementById('messageText');
    var recipient = document.getElementById('recipient').value.trim();
    ws.send(JSON.stringify({ to: recipient || null, message: input.value }));
    input.value = '';
}

// ?user=alice&to=bob&msg=hi connects and sends on load
document.addEventListener('DOMContentLoaded', function() {
    var params = new URLSearchParams(window.location.search);
    var user = params.get('user');
    if (!user) {
        return;
    }
    document.getElementById('username').value = user;
    var recipient = params.get('to');
    if (recipient) {
        document.getElementById('recipient').value = recipient;
    }
    connect();
    var autoMsg = params.get('msg');
    if (autoMsg) {
        ws.addEventListener('open', function() {
            document.getElementById('messageText').value = autoMsg;
            sendMessage();
        });
    }
});
"#;

pub async fn index_page() -> impl IntoResponse {
    html! {
        (DOCTYPE)
        html {
            head {
                title { "Chat Relay" }
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                style { (PreEscaped(CSS)) }
            }
            body {
                main {
                    h1 { "Chat Relay" }
                    div class="row" {
                        input type="text" id="username" placeholder="Username" autocomplete="off";
                        button id="connectBtn" onclick="connect()" { "Connect" }
                    }
                    div id="status" { "Disconnected" }
                    div class="row" {
                        input type="text" id="recipient" placeholder="Recipient (empty = everyone)" autocomplete="off";
                    }
                    form class="row" onsubmit="sendMessage(); return false;" {
                        input type="text" id="messageText" placeholder="Message" autocomplete="off";
                        button type="submit" { "Send" }
                    }
                    div id="messages" {}
                }
                script { (PreEscaped(SCRIPT)) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_index_page_renders_chat_controls() {
        let resp = index_page().await.into_response();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        for id in ["username", "recipient", "messageText", "messages", "connectBtn"] {
            assert!(html.contains(&format!("id=\"{id}\"")), "missing #{id}");
        }
        assert!(html.contains("'/ws/' + encodeURIComponent(username)"));
    }
}
