// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of zephyr.
//
// zephyr is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// zephyr is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with zephyr.  If not,
// see <http://www.gnu.org/licenses/>.

//! # zephyr public API bodies
//!
//! Request & response bodies for the public zephyr API. Field names are camel-cased on the wire
//! since the principal consumer is a JavaScript front end.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ErrorCode, PostId, TrendingTopic, UserId};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        trending topics                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrendingTopicsRsp {
    pub topics: Vec<TrendingTopic>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           post views                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IncrementViewRsp {
    pub views: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ViewsRsp {
    pub views: u64,
    /// True if this post has ever had a view recorded
    pub tracked: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipleViewsReq {
    pub post_ids: Vec<PostId>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MultipleViewsRsp {
    pub views: HashMap<PostId, u64>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            mentions                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The public face of a user mentioned in a post
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionedUser {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MentionsRsp {
    pub mentions: Vec<MentionedUser>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMentionsReq {
    #[serde(default)]
    pub user_ids: Vec<UserId>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          auth errors                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything the login-error page needs to render a failed sign-in
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthErrorRsp {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}
