// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of newsfeed.
//
// newsfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// newsfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with newsfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # http
//!
//! newsfeed's internal HTTP API. It sits behind the content service, which owns users & posts &
//! does whatever authentication is required; nothing here checks who's calling.
//!
//! - `GET /healthcheck`
//! - `GET /users/{id}/newsfeeds?before=|after=`: one page of a feed; cursors are microseconds
//! - `POST /posts`: a post has been created; write it to its author's feed & fan it out
//! - `POST /friendships`, `DELETE /friendships`: follow & unfollow

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, error};

use crate::{
    entities::{NewsFeedEntry, Post, PostId, Timestamp, UserId},
    fanout::{self, FanoutCoordinator},
    graph::Friendships,
    newsfeeds::{self, NewsFeeds},
    paginate::{self, Cursor, parse_cursor},
    wide_column,
};

/// A serializable struct for use in HTTP error responses
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid cursor"))]
    BadCursor { text: String },
    #[snafu(display("{source}"))]
    Cursor { source: paginate::Error },
    #[snafu(display("Failed to fan-out post {post_id}: {source}"))]
    Fanout {
        post_id: PostId,
        source: fanout::Error,
    },
    #[snafu(display("Failed to read {user}'s news feed: {source}"))]
    Feed {
        user: UserId,
        source: newsfeeds::Error,
    },
    #[snafu(display("Failed to update the social graph: {source}"))]
    Graph { source: wide_column::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadCursor { .. } | Error::Cursor { .. } => {
                (StatusCode::BAD_REQUEST, format!("{}", self))
            }
            Error::Fanout { .. } | Error::Feed { .. } | Error::Graph { .. } => {
                error!("{}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{}", self))
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Application state available to all handlers
pub struct NewsFeed {
    pub feeds: Arc<NewsFeeds>,
    pub graph: Arc<Friendships>,
    pub coordinator: FanoutCoordinator,
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedParams {
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FeedResponse {
    pub newsfeeds: Vec<NewsFeedEntry>,
    pub has_next: bool,
    /// Pass this as `before` to get the next page
    pub next_before: Option<Timestamp>,
}

fn cursor_param(text: Option<String>) -> Result<Option<Timestamp>> {
    text.map(|text| parse_cursor(&text).context(BadCursorSnafu { text }))
        .transpose()
}

async fn newsfeeds(
    State(state): State<Arc<NewsFeed>>,
    Path(user): Path<i64>,
    Query(params): Query<FeedParams>,
) -> Result<Json<FeedResponse>> {
    let user = UserId(user);
    let cursor = Cursor::from_params(cursor_param(params.before)?, cursor_param(params.after)?)
        .context(CursorSnafu)?;
    let page = state
        .feeds
        .page(user, &cursor)
        .await
        .context(FeedSnafu { user })?;
    let next_before = if page.has_next {
        page.items.last().map(|entry| entry.created_at)
    } else {
        None
    };
    Ok(Json(FeedResponse {
        newsfeeds: page.items,
        has_next: page.has_next,
        next_before,
    }))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NewPost {
    pub id: PostId,
    pub user_id: UserId,
    /// Defaults to now
    pub created_at: Option<Timestamp>,
    #[serde(default)]
    pub content: String,
}

async fn create_post(
    State(state): State<Arc<NewsFeed>>,
    Json(req): Json<NewPost>,
) -> Result<(StatusCode, Json<NewsFeedEntry>)> {
    let post = Post {
        id: req.id,
        user_id: req.user_id,
        created_at: req.created_at.unwrap_or_else(Timestamp::now),
        content: req.content,
    };
    let entry = state
        .coordinator
        .on_post_created(&post)
        .await
        .context(FanoutSnafu { post_id: post.id })?;
    debug!("Post {} by {} accepted", post.id, post.user_id);
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Friendship {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FriendshipResponse {
    /// False if there was nothing to do
    pub changed: bool,
}

async fn follow(
    State(state): State<Arc<NewsFeed>>,
    Json(req): Json<Friendship>,
) -> Result<Json<FriendshipResponse>> {
    let changed = state
        .graph
        .follow(req.from_user_id, req.to_user_id)
        .await
        .context(GraphSnafu)?;
    Ok(Json(FriendshipResponse { changed }))
}

async fn unfollow(
    State(state): State<Arc<NewsFeed>>,
    Json(req): Json<Friendship>,
) -> Result<Json<FriendshipResponse>> {
    let changed = state
        .graph
        .unfollow(req.from_user_id, req.to_user_id)
        .await
        .context(GraphSnafu)?;
    Ok(Json(FriendshipResponse { changed }))
}

/// Return a [Router] for the newsfeed API
pub fn make_router(state: Arc<NewsFeed>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/users/{id}/newsfeeds", get(newsfeeds))
        .route("/posts", post(create_post))
        .route("/friendships", post(follow).delete(unfollow))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use crate::{
        background_tasks::{BackgroundTasks, Config, Context},
        config::{ExecutionMode, Settings},
        counters::Counters,
        events::EventBus,
        memory::{MemoryCache, MemoryStore, MemoryTasks},
        metrics::Instruments,
    };

    async fn state() -> Arc<NewsFeed> {
        let settings = Settings {
            page_size: 2,
            mode: ExecutionMode::Test,
            ..Default::default()
        };
        let storage = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(64));
        let instruments = Arc::new(Instruments::new("newsfeed"));
        let feeds = Arc::new(NewsFeeds::new(
            storage.clone(),
            cache.clone(),
            &settings,
            instruments.clone(),
        ));
        feeds.create_if_missing().await.unwrap();
        let graph = Arc::new(Friendships::new(
            storage,
            settings.mode,
            settings.io_timeout,
        ));
        graph.create_if_missing().await.unwrap();
        let context = Context {
            feeds: feeds.clone(),
            events: Arc::new(EventBus::new(feeds.clone(), Counters::new(cache, &settings))),
            graph: graph.clone(),
            tasks: Arc::new(BackgroundTasks::new(
                Arc::new(MemoryTasks::new()),
                Config::default(),
                instruments.clone(),
            )),
            settings,
        };
        Arc::new(NewsFeed {
            feeds,
            graph,
            coordinator: FanoutCoordinator::new(context, instruments),
        })
    }

    async fn body<T: serde::de::DeserializeOwned>(rsp: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(rsp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json(method: &str, uri: &str, value: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthcheck() {
        let rsp = make_router(state().await)
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_then_page() {
        let state = state().await;
        for (id, t) in [(1, 100), (2, 200), (3, 300)] {
            let rsp = make_router(state.clone())
                .oneshot(json(
                    "POST",
                    "/posts",
                    serde_json::json!({"id": id, "user_id": 8, "created_at": t}),
                ))
                .await
                .unwrap();
            assert_eq!(rsp.status(), StatusCode::CREATED);
        }

        let rsp = make_router(state.clone())
            .oneshot(
                Request::get("/users/8/newsfeeds")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        let page: FeedResponse = body(rsp).await;
        assert_eq!(
            page.newsfeeds
                .iter()
                .map(|e| e.post_id)
                .collect::<Vec<_>>(),
            vec![PostId(3), PostId(2)]
        );
        assert!(page.has_next);
        assert_eq!(page.next_before, Some(Timestamp(200)));

        let rsp = make_router(state.clone())
            .oneshot(
                Request::get("/users/8/newsfeeds?before=200")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let page: FeedResponse = body(rsp).await;
        assert_eq!(page.newsfeeds.len(), 1);
        assert!(!page.has_next);

        let rsp = make_router(state.clone())
            .oneshot(
                Request::get("/users/8/newsfeeds?before=200&after=100")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);

        // Cursors no row key can carry are the caller's mistake
        for query in ["before=-1", "after=-1", "before=10000000000000000"] {
            let rsp = make_router(state.clone())
                .oneshot(
                    Request::get(format!("/users/8/newsfeeds?{query}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(rsp.status(), StatusCode::BAD_REQUEST, "{query}");
        }
    }

    #[tokio::test]
    async fn friendships() {
        let state = state().await;
        let edge = serde_json::json!({"from_user_id": 1, "to_user_id": 2});
        let rsp = make_router(state.clone())
            .oneshot(json("POST", "/friendships", edge.clone()))
            .await
            .unwrap();
        assert!(body::<FriendshipResponse>(rsp).await.changed);
        let rsp = make_router(state.clone())
            .oneshot(json("POST", "/friendships", edge.clone()))
            .await
            .unwrap();
        assert!(!body::<FriendshipResponse>(rsp).await.changed);
        assert!(
            state
                .graph
                .has_followed(UserId(1), UserId(2))
                .await
                .unwrap()
        );
        let rsp = make_router(state.clone())
            .oneshot(json("DELETE", "/friendships", edge))
            .await
            .unwrap();
        assert!(body::<FriendshipResponse>(rsp).await.changed);

        let rsp = make_router(state)
            .oneshot(
                Request::get("/users/1/newsfeeds?after=yesterday")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    }
}
