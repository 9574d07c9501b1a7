use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::warn;

use crate::memo::MetadataCache;
use crate::models::{Attachment, Comment, Issue, IssueLink, LinkKind, User};

/// 日付として受け付ける書式（先に成功したものを採用）
const OFFSET_DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M %z"];
const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];
const DATE_ONLY_FORMAT: &str = "%Y-%m-%d";

/// 値の付いた葉要素1つ分
#[derive(Debug, Clone, Default)]
pub(crate) struct LeafField {
    pub name: String,
    /// `name` 属性（ユーザー要素の表示名）
    pub display_name: Option<String>,
    pub text: String,
}

impl LeafField {
    pub fn new(name: String, display_name: Option<String>) -> Self {
        Self {
            name,
            display_name,
            text: String::new(),
        }
    }

    fn user(&self) -> Option<User> {
        let login = self.text.trim();
        (!login.is_empty()).then(|| User::new(login, self.display_name.clone()))
    }
}

/// 組み立て中のIssueと、同じレコード内で後から解決する参照
#[derive(Debug, Default)]
pub(crate) struct IssueFrame {
    pub issue: Issue,
    /// product より前に現れた component 名
    pub pending_components: Vec<String>,
}

/// 古いサーバーが出力するタイムゾーン略称と、そのオフセット
const ZONE_OFFSETS: &[(&str, &str)] = &[
    ("UTC", "+0000"),
    ("GMT", "+0000"),
    ("Z", "+0000"),
    ("WET", "+0000"),
    ("BST", "+0100"),
    ("CET", "+0100"),
    ("CEST", "+0200"),
    ("EET", "+0200"),
    ("EEST", "+0300"),
    ("MSK", "+0300"),
    ("IST", "+0530"),
    ("JST", "+0900"),
    ("AEST", "+1000"),
    ("EST", "-0500"),
    ("EDT", "-0400"),
    ("CST", "-0600"),
    ("CDT", "-0500"),
    ("MST", "-0700"),
    ("MDT", "-0600"),
    ("PST", "-0800"),
    ("PDT", "-0700"),
];

pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let (stamp, normalized) = match raw.rsplit_once(' ') {
        Some((stamp, zone)) if !zone.is_empty() && zone.chars().all(|c| c.is_ascii_alphabetic()) => {
            match ZONE_OFFSETS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(zone))
            {
                Some((_, offset)) => (stamp, format!("{} {}", stamp, offset)),
                None => {
                    warn!(value = raw, zone, "Unknown time zone abbreviation; reading the time as UTC");
                    (stamp, stamp.to_string())
                }
            }
        }
        _ => (raw, raw.to_string()),
    };

    OFFSET_DATE_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(&normalized, format).ok())
        .map(|date| date.with_timezone(&Utc))
        .or_else(|| {
            NAIVE_DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(stamp, format).ok())
                .map(|naive| naive.and_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(stamp, DATE_ONLY_FORMAT)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
}

pub(crate) fn parse_bool(raw: &str) -> bool {
    raw.trim() == "1"
}

fn non_blank(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty() && raw != "---").then(|| raw.to_string())
}

fn link(kind: LinkKind, raw: &str) -> Option<IssueLink> {
    non_blank(raw).map(|target| IssueLink::new(kind, target))
}

fn date_field(owner: &str, field: &LeafField) -> Option<DateTime<Utc>> {
    let parsed = parse_date(&field.text);
    if parsed.is_none() && !field.text.trim().is_empty() {
        warn!(owner, field = %field.name, value = %field.text, "Unparsable date, leaving field unset");
    }
    parsed
}

fn int_field(owner: &str, field: &LeafField) -> Option<i64> {
    match field.text.trim().parse::<i64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(owner, field = %field.name, value = %field.text, error = %e, "Unparsable integer, leaving field unset");
            None
        }
    }
}

fn float_field(owner: &str, field: &LeafField) -> Option<f64> {
    match field.text.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(owner, field = %field.name, value = %field.text, error = %e, "Unparsable number, leaving field unset");
            None
        }
    }
}

impl IssueFrame {
    pub fn set_field(&mut self, field: LeafField, cache: &mut MetadataCache) {
        let issue = &mut self.issue;
        let owner = issue.id.clone();
        let text = field.text.trim().to_string();

        match field.name.as_str() {
            "bug_id" => issue.id = text,
            "short_desc" => issue.summary = Some(field.text),
            "description" => issue.description = Some(field.text),
            "creation_ts" => issue.created = date_field(&owner, &field),
            "delta_ts" => issue.updated = date_field(&owner, &field),
            "classification" => issue.classification = cache.classifications.get(text),
            "product" => {
                issue.project = cache.projects.get(text.clone());
                let pending = std::mem::take(&mut self.pending_components);
                let resolved = cache
                    .components
                    .get_all(pending.into_iter().map(|name| (text.clone(), name)));
                issue.components.extend(resolved);
            }
            "component" => match &issue.project {
                Some(project) => {
                    let key = (project.name.clone(), text);
                    issue.components.extend(cache.components.get(key));
                }
                None => self.pending_components.push(text),
            },
            "bug_status" => issue.status = cache.statuses.get(text),
            "resolution" => issue.resolution = cache.resolutions.get(text),
            "priority" => issue.priority = cache.priorities.get(text),
            "bug_severity" => issue.severity = cache.severities.get(text),
            "bug_type" => issue.issue_type = cache.issue_types.get(text),
            "version" => issue.affected_versions.extend(non_blank(&text)),
            "target_milestone" => issue.planned_versions.extend(non_blank(&text)),
            "cf_fixed_in" | "fixed_in" => issue.fix_versions.extend(non_blank(&text)),
            "reporter" => issue.reporter = field.user(),
            "assigned_to" => issue.assignee = field.user(),
            "cc" => issue.cc.extend(non_blank(&text)),
            "keywords" => issue.keywords.extend(
                text.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string),
            ),
            "votes" => issue.votes = int_field(&owner, &field),
            "estimated_time" => issue.estimated_time = float_field(&owner, &field),
            "everconfirmed" => issue.confirmed = Some(parse_bool(&text)),
            "dependson" => issue.links.extend(link(LinkKind::DependsOn, &text)),
            "blocked" => issue.links.extend(link(LinkKind::Blocks, &text)),
            "dup_id" => issue.links.extend(link(LinkKind::DuplicateOf, &text)),
            "see_also" => issue.links.extend(link(LinkKind::SeeAlso, &text)),
            _ => issue
                .custom_fields
                .entry(field.name)
                .or_default()
                .push(field.text),
        }
    }

    /// レコード終端での後処理。未解決の参照はここで確定させる
    pub fn finish(mut self, cache: &mut MetadataCache) -> Issue {
        if !self.pending_components.is_empty() {
            warn!(
                issue = %self.issue.id,
                components = ?self.pending_components,
                "Components without a product in the same record; resolving without project"
            );
            let orphans = std::mem::take(&mut self.pending_components);
            let resolved = cache
                .components
                .get_all(orphans.into_iter().map(|name| (String::new(), name)));
            self.issue.components.extend(resolved);
        }

        let issue = &mut self.issue;
        if issue.description.is_none() {
            issue.description = issue.comments.first().map(|c| c.text.clone());
        }

        for comment in &issue.comments {
            for id in &comment.attachment_ids {
                if !issue.attachments.iter().any(|a| a.id.as_ref() == Some(id)) {
                    warn!(
                        issue = %issue.id,
                        comment = ?comment.id,
                        attachment = %id,
                        "Comment references an attachment outside this record"
                    );
                }
            }
        }

        self.issue
    }
}

pub(crate) fn set_comment_field(comment: &mut Comment, owner: &str, field: LeafField) {
    match field.name.as_str() {
        "commentid" => comment.id = non_blank(&field.text),
        "who" => comment.author = field.user(),
        "bug_when" => comment.created = date_field(owner, &field),
        "thetext" => comment.text = field.text,
        "attachid" => comment.attachment_ids.extend(non_blank(&field.text)),
        _ => {}
    }
}

pub(crate) fn set_attachment_field(attachment: &mut Attachment, owner: &str, field: LeafField) {
    match field.name.as_str() {
        "attachid" => attachment.id = non_blank(&field.text),
        "date" => attachment.created = date_field(owner, &field),
        "delta_ts" => attachment.updated = date_field(owner, &field),
        "desc" => attachment.description = Some(field.text),
        "filename" => attachment.filename = non_blank(&field.text),
        "type" => attachment.mime_type = non_blank(&field.text),
        "size" => attachment.size = int_field(owner, &field),
        "attacher" => attachment.attacher = field.user(),
        _ => {}
    }
}

/// 同じデコーダー内で共有されるメタデータかどうか（テスト用の補助）
#[cfg(test)]
pub(crate) fn same_instance<T>(
    a: &Option<std::sync::Arc<T>>,
    b: &Option<std::sync::Arc<T>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => std::sync::Arc::ptr_eq(a, b),
        _ => false,
    }
}
