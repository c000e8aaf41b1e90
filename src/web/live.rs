//! Live conversation channel over WebSocket.
//!
//! A connection subscribes to one `conversation-{id}` channel on the hub and
//! relays every published event as a text frame. Client pings and pongs
//! count as presence heartbeats. Closing the user's last socket takes them
//! offline. A connection ends itself when its user leaves the conversation.

use crate::fanout::message::{Subscribe, Unsubscribe};
use crate::fanout::message::participant_left;
use crate::fanout::{channel_name, ConversationHub, EventPush};
use crate::messaging::{Caller, MessagingService};
use actix::{
    fut, Actor, ActorContext, ActorFutureExt, Addr, AsyncContext, ContextFutureSpawner, Handler,
    Running, StreamHandler, WrapFuture,
};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Server ping interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Disconnect if the client is silent this long
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) fn configure(conf: &mut web::ServiceConfig) {
    conf.service(live_ws);
}

/// Client -> server commands
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientCommand {
    Typing { is_typing: bool },
    Visibility { online: bool },
}

/// True if `payload` says `user_id` left the conversation.
fn is_own_leave(payload: &str, user_id: i32) -> bool {
    participant_left(payload) == Some(user_id)
}

pub struct LiveConnection {
    /// Subscription ID (assigned by hub)
    id: usize,
    user_id: i32,
    conversation_id: i32,
    hb: Instant,
    /// Set once the user has left the conversation
    closed: bool,
    hub: Addr<ConversationHub>,
    service: MessagingService,
}

impl LiveConnection {
    pub fn new(
        user_id: i32,
        conversation_id: i32,
        hub: Addr<ConversationHub>,
        service: MessagingService,
    ) -> Self {
        Self {
            id: 0,
            user_id,
            conversation_id,
            hb: Instant::now(),
            closed: false,
            hub,
            service,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                log::debug!("Live connection {} timed out", act.id);
                ctx.stop();
                return;
            }

            ctx.ping(b"");
        });
    }

    /// Client activity. Also feeds the presence tracker.
    fn touch(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.hb = Instant::now();

        let presence = self.service.presence().clone();
        let user_id = self.user_id;
        ctx.spawn(fut::wrap_future::<_, Self>(async move {
            presence.heartbeat(user_id).await;
        }));
    }

    fn handle_command(&mut self, command: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        let service = self.service.clone();
        let caller = Caller::User(self.user_id);
        let conversation_id = self.conversation_id;

        match command {
            ClientCommand::Typing { is_typing } => {
                ctx.spawn(fut::wrap_future::<_, Self>(async move {
                    if let Err(e) = service.set_typing(caller, conversation_id, is_typing).await {
                        log::debug!("Typing update rejected: {}", e);
                    }
                }));
            }
            ClientCommand::Visibility { online } => {
                ctx.spawn(fut::wrap_future::<_, Self>(async move {
                    if let Err(e) = service.update_presence(caller, online).await {
                        log::debug!("Visibility update rejected: {}", e);
                    }
                }));
            }
        }
    }
}

impl Actor for LiveConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.service.presence().register_connection(self.user_id);
        self.hb(ctx);
        self.touch(ctx);

        self.hub
            .send(Subscribe {
                channel: channel_name(self.conversation_id),
                addr: ctx.address().recipient(),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(id) => {
                        act.id = id;
                        log::debug!(
                            "Live connection established: id={}, user={}, conversation={}",
                            id,
                            act.user_id,
                            act.conversation_id
                        );
                    }
                    Err(err) => {
                        log::warn!("Failed to subscribe live connection: {:?}", err);
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.hub.do_send(Unsubscribe { id: self.id });

        let presence = self.service.presence().clone();
        let user_id = self.user_id;
        actix_web::rt::spawn(async move {
            presence.disconnect(user_id).await;
        });

        Running::Stop
    }
}

impl Handler<EventPush> for LiveConnection {
    type Result = ();

    fn handle(&mut self, msg: EventPush, ctx: &mut Self::Context) {
        if self.closed {
            return;
        }

        let left = is_own_leave(&msg.0, self.user_id);
        ctx.text(msg.0);

        if left {
            log::debug!(
                "User {} left conversation {}, closing live connection {}",
                self.user_id,
                self.conversation_id,
                self.id
            );
            self.closed = true;
            ctx.close(None);
            ctx.stop();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Err(_) => {
                ctx.stop();
                return;
            }
            Ok(msg) => msg,
        };

        match msg {
            ws::Message::Ping(data) => {
                self.touch(ctx);
                ctx.pong(&data);
            }
            ws::Message::Pong(_) => {
                self.touch(ctx);
            }
            ws::Message::Text(text) => {
                let text = text.trim();
                if text == "ping" {
                    self.touch(ctx);
                    ctx.text(r#"{"type":"pong"}"#);
                    return;
                }

                match serde_json::from_str::<ClientCommand>(text) {
                    Ok(command) => self.handle_command(command, ctx),
                    Err(e) => log::debug!("Ignoring unknown live command: {}", e),
                }
            }
            ws::Message::Binary(_) => {}
            ws::Message::Close(reason) => {
                log::debug!("Live client disconnecting: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                ctx.stop();
            }
            ws::Message::Nop => (),
        }
    }
}

/// GET /conversations/{id}/live.ws
///
/// Participants only.
#[get("/conversations/{id}/live.ws")]
pub async fn live_ws(
    req: HttpRequest,
    stream: web::Payload,
    caller: Caller,
    conversation_id: web::Path<i32>,
    service: web::Data<MessagingService>,
    hub: web::Data<Addr<ConversationHub>>,
) -> Result<HttpResponse, Error> {
    let user_id = caller.require_login()?;
    let conversation_id = conversation_id.into_inner();

    service
        .store()
        .ensure_participant(conversation_id, user_id)
        .await?;

    log::debug!(
        "User {} connecting to conversation {} live channel",
        user_id,
        conversation_id
    );

    let connection = LiveConnection::new(
        user_id,
        conversation_id,
        hub.get_ref().clone(),
        service.get_ref().clone(),
    );

    ws::start(connection, &req, stream)
}
