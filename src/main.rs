use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, Message, MessageId, User, UserId,
};
use teloxide::utils::command::{BotCommands, ParseError};
use time::{Month, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};

// Canonical ledger keys, with the English spellings accepted on input.
const MONTHS: [&str; 12] = [
    "janeiro", "fevereiro", "março", "abril", "maio", "junho", "julho", "agosto", "setembro",
    "outubro", "novembro", "dezembro",
];
const MONTHS_EN: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

// Day-of-month triggers for the three daily jobs.
const REMINDER_DAY: u8 = 13;
const OVERDUE_DAY: u8 = 15;
const SUMMARY_DAY: u8 = 1;

fn month_index(name: &str) -> Option<usize> {
    let lower = name.trim().to_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .or_else(|| MONTHS_EN.iter().position(|m| *m == lower))
}

fn canonical_month(name: &str) -> Option<&'static str> {
    month_index(name).map(|i| MONTHS[i])
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn join_months(idxs: &[usize]) -> String {
    idxs.iter()
        .map(|&i| capitalize(MONTHS[i]))
        .collect::<Vec<_>>()
        .join(", ")
}

fn months_data(idxs: &[usize]) -> String {
    idxs.iter()
        .map(|&i| (i + 1).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_months_data(csv: &str) -> Vec<usize> {
    csv.split(',')
        .filter_map(|t| t.parse::<usize>().ok())
        .filter(|n| (1..=12).contains(n))
        .map(|n| n - 1)
        .collect()
}

fn current_month_index(now: OffsetDateTime) -> usize {
    u8::from(now.month()) as usize - 1
}

/// Month/year the summary job reports on, i.e. the one that just ended.
fn previous_month(now: OffsetDateTime) -> (String, usize) {
    let year = if now.month() == Month::January {
        now.year() - 1
    } else {
        now.year()
    };
    (year.to_string(), u8::from(now.month().previous()) as usize - 1)
}

// --- persisted document ---

/// Channel ids are persisted as nullable integer-as-string; older files
/// carry plain numbers, so deserialization accepts both.
mod chan_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(id) => s.serialize_some(&id.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Str(String),
        }
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Num(n)) => Ok(Some(n)),
            Some(Raw::Str(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Settings {
    #[serde(default, with = "chan_id")]
    lembrete_channel_id: Option<i64>,
    #[serde(default, with = "chan_id")]
    commands_channel_id: Option<i64>,
    #[serde(default, with = "chan_id")]
    confirmation_channel_id: Option<i64>,
}

/// Where a dispatched message lives, so it can be edited later without
/// holding on to any live platform handle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct MsgRef {
    chat_id: i64,
    message_id: i32,
}

impl MsgRef {
    fn of(m: &Message) -> Self {
        MsgRef {
            chat_id: m.chat.id.0,
            message_id: m.id.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PendingEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confirmation_message_id: Option<MsgRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_message_id: Option<MsgRef>,
}

type MonthFlags = BTreeMap<String, bool>;
type UserHistory = BTreeMap<String, MonthFlags>;
type PendingTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, PendingEntry>>>;

/// The whole ledger. On disk the user map is flattened to the top level,
/// next to the reserved `settings` and `pending_payments` keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PaymentsDoc {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    pending_payments: PendingTree,
    #[serde(flatten)]
    users: BTreeMap<String, UserHistory>,
}

// --- record store ---

struct Store {
    path: PathBuf,
    // Serializes every load-mutate-save sequence; two racing handlers can
    // no longer overwrite each other's writes.
    gate: Mutex<()>,
}

impl Store {
    fn new(path: impl Into<PathBuf>) -> Self {
        Store {
            path: path.into(),
            gate: Mutex::new(()),
        }
    }

    async fn load(&self) -> PaymentsDoc {
        let _gate = self.gate.lock().await;
        self.load_unlocked().await
    }

    async fn load_unlocked(&self) -> PaymentsDoc {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return PaymentsDoc::default(),
            Err(e) => {
                warn!("cannot read {}: {}", self.path.display(), e);
                return PaymentsDoc::default();
            }
        };
        if raw.trim().is_empty() {
            return PaymentsDoc::default();
        }
        match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("corrupt payments file, resetting: {}", e);
                let mut doc = PaymentsDoc::default();
                if let Err(e) = self.save_unlocked(&mut doc, &Settings::default()).await {
                    warn!("could not persist reset payments file: {:?}", e);
                }
                doc
            }
        }
    }

    async fn save_unlocked(&self, doc: &mut PaymentsDoc, settings: &Settings) -> Result<()> {
        doc.settings = settings.clone();
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// One transaction: load the document, apply `f`, write it back with
    /// the current settings merged in. Held under the gate end to end.
    async fn update<T>(
        &self,
        settings: &Settings,
        f: impl FnOnce(&mut PaymentsDoc) -> T,
    ) -> Result<T> {
        let _gate = self.gate.lock().await;
        let mut doc = self.load_unlocked().await;
        let out = f(&mut doc);
        self.save_unlocked(&mut doc, settings).await?;
        Ok(out)
    }
}

// --- ledger accessors ---

fn fresh_year() -> MonthFlags {
    MONTHS.iter().map(|m| (m.to_string(), false)).collect()
}

fn ensure_user_month(doc: &mut PaymentsDoc, user_id: &str, year: &str, month: &str) {
    let months = doc
        .users
        .entry(user_id.to_string())
        .or_default()
        .entry(year.to_string())
        .or_insert_with(fresh_year);
    months.entry(month.to_string()).or_insert(false);
}

fn set_payment_status(doc: &mut PaymentsDoc, user_id: &str, year: &str, month: &str, paid: bool) {
    ensure_user_month(doc, user_id, year, month);
    if let Some(months) = doc.users.get_mut(user_id).and_then(|h| h.get_mut(year)) {
        months.insert(month.to_string(), paid);
    }
}

/// Normalizing read that also guarantees the entry exists afterwards;
/// scheduler loops rely on the auto-creation.
fn is_month_paid(doc: &mut PaymentsDoc, user_id: &str, year: &str, month: &str) -> bool {
    let canonical = canonical_month(month)
        .map(str::to_string)
        .unwrap_or_else(|| month.trim().to_lowercase());
    ensure_user_month(doc, user_id, year, &canonical);
    doc.users
        .get(user_id)
        .and_then(|h| h.get(year))
        .and_then(|m| m.get(&canonical))
        .copied()
        .unwrap_or(false)
}

fn get_user_payments(doc: &mut PaymentsDoc, user_id: &str, year: &str) -> MonthFlags {
    ensure_user_month(doc, user_id, year, MONTHS[0]);
    doc.users
        .get(user_id)
        .and_then(|h| h.get(year))
        .cloned()
        .unwrap_or_default()
}

/// Destructive year rollover: every user's entire history becomes a single
/// all-unpaid entry for `year`. Prior years are discarded.
fn reset_all_payments(doc: &mut PaymentsDoc, year: &str) {
    for history in doc.users.values_mut() {
        let mut next = UserHistory::new();
        next.insert(year.to_string(), fresh_year());
        *history = next;
    }
}

// --- confirmation workflow ---

#[derive(Debug, Default, PartialEq)]
struct ClaimSplit {
    staged: Vec<usize>,
    already_paid: Vec<usize>,
    already_pending: Vec<usize>,
}

/// Inserts an empty pending record per claimable month. Persisting this
/// before any message goes out is what makes duplicate claims a no-op.
fn stage_claim(
    doc: &mut PaymentsDoc,
    user_id: &str,
    year: &str,
    month_idxs: &[usize],
) -> ClaimSplit {
    let mut split = ClaimSplit::default();
    for &i in month_idxs {
        let month = MONTHS[i];
        if is_month_paid(doc, user_id, year, month) {
            split.already_paid.push(i);
            continue;
        }
        let slot = doc
            .pending_payments
            .entry(user_id.to_string())
            .or_default()
            .entry(year.to_string())
            .or_default();
        if slot.contains_key(month) {
            split.already_pending.push(i);
            continue;
        }
        slot.insert(month.to_string(), PendingEntry::default());
        split.staged.push(i);
    }
    split
}

fn attach_claim_refs(
    doc: &mut PaymentsDoc,
    user_id: &str,
    year: &str,
    month_idxs: &[usize],
    confirmation: MsgRef,
    response: Option<MsgRef>,
) {
    for &i in month_idxs {
        if let Some(entry) = doc
            .pending_payments
            .get_mut(user_id)
            .and_then(|y| y.get_mut(year))
            .and_then(|m| m.get_mut(MONTHS[i]))
        {
            entry.confirmation_message_id = Some(confirmation);
            entry.response_message_id = response;
        }
    }
}

/// Compensation path for a claim whose confirmation message never went out.
fn unstage_claim(doc: &mut PaymentsDoc, user_id: &str, year: &str, month_idxs: &[usize]) {
    if let Some(months) = doc
        .pending_payments
        .get_mut(user_id)
        .and_then(|y| y.get_mut(year))
    {
        for &i in month_idxs {
            months.remove(MONTHS[i]);
        }
    }
    prune_pending(doc, user_id, year);
}

fn prune_pending(doc: &mut PaymentsDoc, user_id: &str, year: &str) {
    if let Some(years) = doc.pending_payments.get_mut(user_id) {
        if years.get(year).is_some_and(|m| m.is_empty()) {
            years.remove(year);
        }
        if years.is_empty() {
            doc.pending_payments.remove(user_id);
        }
    }
}

#[derive(Debug, PartialEq)]
struct Resolved {
    month_idx: usize,
    entry: PendingEntry,
}

/// Resolution is an admin-only mutation. An unauthorized caller gets
/// `None` back and the document stays byte-for-byte untouched.
fn resolve_pending_authorized(
    doc: &mut PaymentsDoc,
    authorized: bool,
    user_id: &str,
    year: &str,
    month_idxs: &[usize],
    approve: bool,
) -> Option<Vec<Resolved>> {
    if !authorized {
        return None;
    }
    Some(resolve_pending(doc, user_id, year, month_idxs, approve))
}

/// Admin decision over a batch of claimed months. Months without a pending
/// record are skipped without aborting the rest. Approval commits the
/// ledger flag; denial leaves it unpaid. Either way the pending record is
/// removed and empty ancestors pruned.
fn resolve_pending(
    doc: &mut PaymentsDoc,
    user_id: &str,
    year: &str,
    month_idxs: &[usize],
    approve: bool,
) -> Vec<Resolved> {
    let mut out = Vec::new();
    for &i in month_idxs {
        let month = MONTHS[i];
        let Some(entry) = doc
            .pending_payments
            .get_mut(user_id)
            .and_then(|y| y.get_mut(year))
            .and_then(|m| m.remove(month))
        else {
            continue;
        };
        if approve {
            set_payment_status(doc, user_id, year, month, true);
        }
        out.push(Resolved {
            month_idx: i,
            entry,
        });
    }
    prune_pending(doc, user_id, year);
    out
}

// --- app state ---

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    settings: Arc<RwLock<Settings>>,
    admin_id: UserId,
    bot_username: String,
}

impl AppState {
    async fn current_settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    async fn with_doc<T>(&self, f: impl FnOnce(&mut PaymentsDoc) -> T) -> Result<T> {
        let settings = self.current_settings().await;
        self.store.update(&settings, f).await
    }

    fn is_admin(&self, user: &User) -> bool {
        user.id == self.admin_id
    }
}

#[derive(Debug, Clone, Copy)]
enum ChannelKind {
    Reminder,
    Commands,
    Confirmation,
}

impl ChannelKind {
    fn label(self) -> &'static str {
        match self {
            ChannelKind::Reminder => "Reminders",
            ChannelKind::Commands => "Commands",
            ChannelKind::Confirmation => "Payment confirmation",
        }
    }
}

async fn set_channel(state: &AppState, kind: ChannelKind, chat: i64) -> Result<()> {
    {
        let mut s = state.settings.write().await;
        match kind {
            ChannelKind::Reminder => s.lembrete_channel_id = Some(chat),
            ChannelKind::Commands => s.commands_channel_id = Some(chat),
            ChannelKind::Confirmation => s.confirmation_channel_id = Some(chat),
        }
    }
    // Empty transaction persists the merged settings.
    state.with_doc(|_| ()).await
}

// --- chat lookups ---

async fn display_name(bot: &Bot, user_id: u64) -> String {
    match bot.get_chat(ChatId(user_id as i64)).await {
        Ok(chat) => chat
            .first_name()
            .map(str::to_string)
            .or_else(|| chat.username().map(str::to_string))
            .or_else(|| chat.title().map(str::to_string))
            .unwrap_or_else(|| format!("user {}", user_id)),
        Err(e) => {
            debug!("get_chat({}) failed: {:?}", user_id, e);
            format!("user {}", user_id)
        }
    }
}

async fn display_name_for_key(bot: &Bot, user_key: &str) -> String {
    match user_key.parse::<u64>() {
        Ok(id) => display_name(bot, id).await,
        Err(_) => format!("user {}", user_key),
    }
}

async fn edit_ref(bot: &Bot, r: MsgRef, text: String) {
    if let Err(e) = bot
        .edit_message_text(ChatId(r.chat_id), MessageId(r.message_id), text)
        .await
    {
        warn!("stale message reference {:?}: {:?}", r, e);
    }
}

fn callback_chat(q: &CallbackQuery) -> ChatId {
    q.message
        .as_ref()
        .and_then(|m| m.regular_message())
        .map(|m| m.chat.id)
        .unwrap_or(ChatId(q.from.id.0 as i64))
}

async fn edit_callback_message(
    bot: &Bot,
    q: &CallbackQuery,
    text: String,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<()> {
    if let Some(msg) = q.message.as_ref().and_then(|m| m.regular_message()) {
        let mut req = bot.edit_message_text(msg.chat.id, msg.id, text);
        if let Some(kb) = markup {
            req = req.reply_markup(kb);
        }
        req.await?;
    } else {
        bot.send_message(ChatId(q.from.id.0 as i64), text).await?;
    }
    Ok(())
}

// --- keyboards ---

fn claim_keyboard(user_id: u64, year: &str, month_idx: usize) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback(
            "✅ Yes",
            format!("claim:{}:{}:{}", user_id, year, month_idx + 1),
        ),
        InlineKeyboardButton::callback("❌ No", format!("dismiss:{}", user_id)),
    ]])
}

fn confirm_keyboard(user_id: u64, year: &str, month_idxs: &[usize]) -> InlineKeyboardMarkup {
    let months = months_data(month_idxs);
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback(
            "✅ Confirm",
            format!("confirm:{}:{}:{}", user_id, year, months),
        ),
        InlineKeyboardButton::callback("❌ Deny", format!("deny:{}:{}:{}", user_id, year, months)),
    ]])
}

fn year_nav_keyboard(user_id: u64, year: &str, available_years: &[String]) -> InlineKeyboardMarkup {
    let prev = available_years
        .iter()
        .filter(|y| y.as_str() < year)
        .max()
        .cloned();
    let next = available_years
        .iter()
        .filter(|y| y.as_str() > year)
        .min()
        .cloned();

    let mut nav = Vec::new();
    if let Some(prev) = prev {
        nav.push(InlineKeyboardButton::callback(
            format!("⬅️ {}", prev),
            format!("plist:{}:{}", user_id, prev),
        ));
    }
    if let Some(next) = next {
        nav.push(InlineKeyboardButton::callback(
            format!("{} ➡️", next),
            format!("plist:{}:{}", user_id, next),
        ));
    }

    let mut rows = Vec::new();
    if !nav.is_empty() {
        rows.push(nav);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "✖️ Close",
        format!("pclose:{}", user_id),
    )]);
    InlineKeyboardMarkup::new(rows)
}

fn admin_nav_keyboard(invoker: u64, index: usize, total: usize) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if total > 1 {
        let prev = (index + total - 1) % total;
        let next = (index + 1) % total;
        rows.push(vec![
            InlineKeyboardButton::callback("⬅️ Previous", format!("alist:{}:{}", invoker, prev)),
            InlineKeyboardButton::callback("Next ➡️", format!("alist:{}:{}", invoker, next)),
        ]);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "✖️ Close",
        format!("pclose:{}", invoker),
    )]);
    InlineKeyboardMarkup::new(rows)
}

fn render_payment_table(name: &str, year: &str, payments: &MonthFlags) -> String {
    let mut out = format!("📅 Payments for {} ({})\n", name, year);
    for month in MONTHS {
        let paid = payments.get(month).copied().unwrap_or(false);
        out.push_str(&format!(
            "{}: {}\n",
            capitalize(month),
            if paid { "✅" } else { "❌" }
        ));
    }
    out
}

fn help_text() -> &'static str {
    "💸 Subscription payment bot\n\n\
     /claim <months> — mark one or more months as paid, awaiting admin \
     confirmation (e.g. /claim janeiro fevereiro).\n\
     /list_payments — your payment status for the current year.\n\
     /list_all_payments — every user's payments, with navigation. [admin]\n\
     /test_reminder — send test reminders for the current month. [admin]\n\
     /set_reminder_channel [chat id] — chat for reminders and summaries. [admin]\n\
     /set_commands_channel [chat id] — chat where commands are accepted. [admin]\n\
     /set_confirmation_channel [chat id] — chat for payment confirmations. [admin]\n\
     /help — this list.\n\n\
     Channel commands default to the chat they are issued in."
}

// --- commands ---

fn remainder(input: String) -> Result<(String,), ParseError> {
    Ok((input.trim().to_string(),))
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case")]
enum Command {
    #[command(description = "claim months as paid", parse_with = remainder)]
    Claim(String),
    #[command(description = "show your payments for the current year")]
    ListPayments,
    #[command(description = "show all users' payments (admin)")]
    ListAllPayments,
    #[command(description = "send test reminders (admin)")]
    TestReminder,
    #[command(description = "set the reminders chat (admin)", parse_with = remainder)]
    SetReminderChannel(String),
    #[command(description = "set the commands chat (admin)", parse_with = remainder)]
    SetCommandsChannel(String),
    #[command(description = "set the confirmation chat (admin)", parse_with = remainder)]
    SetConfirmationChannel(String),
    #[command(description = "list commands")]
    Help,
}

async fn handle_message(bot: Bot, state: AppState, msg: Message) -> Result<()> {
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }

    register_author(&state, &user).await;

    let Some(text) = msg.text() else {
        return Ok(());
    };
    let cmd = match Command::parse(text, &state.bot_username) {
        Ok(cmd) => cmd,
        Err(e) => {
            if text.starts_with('/') {
                debug!("unrecognized command {:?}: {:?}", text, e);
            }
            return Ok(());
        }
    };

    if !command_channel_ok(&bot, &state, &msg, &cmd).await? {
        return Ok(());
    }

    match cmd {
        Command::Claim(months) => handle_claim(&bot, &state, &msg, &user, &months).await,
        Command::ListPayments => handle_list_payments(&bot, &state, &msg, &user).await,
        Command::ListAllPayments => handle_list_all_payments(&bot, &state, &msg, &user).await,
        Command::TestReminder => handle_test_reminder(&bot, &state, &msg, &user).await,
        Command::SetReminderChannel(arg) => {
            handle_set_channel(&bot, &state, &msg, &user, ChannelKind::Reminder, &arg).await
        }
        Command::SetCommandsChannel(arg) => {
            handle_set_channel(&bot, &state, &msg, &user, ChannelKind::Commands, &arg).await
        }
        Command::SetConfirmationChannel(arg) => {
            handle_set_channel(&bot, &state, &msg, &user, ChannelKind::Confirmation, &arg).await
        }
        Command::Help => {
            bot.send_message(msg.chat.id, help_text()).await?;
            Ok(())
        }
    }
}

/// Any message registers its author in the ledger for the current month.
async fn register_author(state: &AppState, user: &User) {
    let now = OffsetDateTime::now_utc();
    let year = now.year().to_string();
    let month = MONTHS[current_month_index(now)];
    let uid = user.id.to_string();
    if let Err(e) = state
        .with_doc(move |doc| ensure_user_month(doc, &uid, &year, month))
        .await
    {
        warn!("failed to register user {}: {:?}", user.id, e);
    }
}

/// Once a commands chat is configured, everything but the channel
/// configuration commands (admin, usable anywhere) must be issued there.
async fn command_channel_ok(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    cmd: &Command,
) -> Result<bool> {
    let settings = state.current_settings().await;
    let Some(commands_chat) = settings.commands_channel_id else {
        return Ok(true);
    };
    if msg.chat.id.0 == commands_chat {
        return Ok(true);
    }

    let is_config = matches!(
        cmd,
        Command::SetReminderChannel(_)
            | Command::SetCommandsChannel(_)
            | Command::SetConfirmationChannel(_)
    );
    let from = msg.from.as_ref();
    if is_config && from.is_some_and(|u| state.is_admin(u)) {
        return Ok(true);
    }

    if let Some(u) = from {
        if let Err(e) = bot
            .send_message(
                ChatId(u.id.0 as i64),
                format!(
                    "Please use commands in the configured commands chat ({}).",
                    commands_chat
                ),
            )
            .await
        {
            debug!("could not redirect user {}: {:?}", u.id, e);
        }
    }
    Ok(false)
}

async fn handle_claim(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    user: &User,
    raw: &str,
) -> Result<()> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Please specify valid months (e.g. /claim janeiro fevereiro).",
        )
        .await?;
        return Ok(());
    }

    let mut idxs = Vec::new();
    let mut unknown = Vec::new();
    for t in &tokens {
        match month_index(t) {
            Some(i) if !idxs.contains(&i) => idxs.push(i),
            Some(_) => {}
            None => unknown.push(*t),
        }
    }
    if !unknown.is_empty() {
        bot.send_message(
            msg.chat.id,
            format!(
                "Unknown months: {}. Use names like janeiro or february.",
                unknown.join(", ")
            ),
        )
        .await?;
        return Ok(());
    }

    let settings = state.current_settings().await;
    let Some(conf_chat) = settings.confirmation_channel_id.map(ChatId) else {
        bot.send_message(
            msg.chat.id,
            "Confirmation channel not set. Please contact an administrator.",
        )
        .await?;
        return Ok(());
    };

    let year = OffsetDateTime::now_utc().year().to_string();
    let uid = user.id.to_string();

    let split = {
        let uid = uid.clone();
        let year = year.clone();
        let idxs = idxs.clone();
        state
            .with_doc(move |doc| stage_claim(doc, &uid, &year, &idxs))
            .await?
    };

    if !split.already_paid.is_empty() {
        bot.send_message(
            msg.chat.id,
            format!(
                "The months {} are already paid and were not added.",
                join_months(&split.already_paid)
            ),
        )
        .await?;
    }
    if split.staged.is_empty() {
        if !split.already_pending.is_empty() {
            bot.send_message(
                msg.chat.id,
                format!(
                    "The months {} are already awaiting admin confirmation.",
                    join_months(&split.already_pending)
                ),
            )
            .await?;
        }
        return Ok(());
    }

    let label = join_months(&split.staged);
    let conf_text = format!(
        "{} marked {}/{} as paid. Administrator, please confirm:",
        user.full_name(),
        label,
        year
    );
    let conf_msg = match bot
        .send_message(conf_chat, conf_text)
        .reply_markup(confirm_keyboard(user.id.0, &year, &split.staged))
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!("confirmation dispatch failed for user {}: {:?}", uid, e);
            let uid = uid.clone();
            let year = year.clone();
            let staged = split.staged.clone();
            state
                .with_doc(move |doc| unstage_claim(doc, &uid, &year, &staged))
                .await?;
            bot.send_message(
                msg.chat.id,
                "Confirmation channel not found. Please contact an administrator.",
            )
            .await?;
            return Ok(());
        }
    };

    let response = bot
        .send_message(
            msg.chat.id,
            format!(
                "Payment intention for {} registered! Awaiting admin confirmation.",
                label
            ),
        )
        .await
        .ok();

    let conf_ref = MsgRef::of(&conf_msg);
    let resp_ref = response.as_ref().map(MsgRef::of);
    let staged = split.staged.clone();
    state
        .with_doc(move |doc| attach_claim_refs(doc, &uid, &year, &staged, conf_ref, resp_ref))
        .await?;
    Ok(())
}

async fn handle_list_payments(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    user: &User,
) -> Result<()> {
    let year = OffsetDateTime::now_utc().year().to_string();
    let uid = user.id.to_string();
    let (payments, years) = {
        let uid = uid.clone();
        let year = year.clone();
        state
            .with_doc(move |doc| {
                let payments = get_user_payments(doc, &uid, &year);
                let years: Vec<String> = doc
                    .users
                    .get(&uid)
                    .map(|h| h.keys().cloned().collect())
                    .unwrap_or_default();
                (payments, years)
            })
            .await?
    };

    let text = render_payment_table(&user.full_name(), &year, &payments);
    bot.send_message(msg.chat.id, text)
        .reply_markup(year_nav_keyboard(user.id.0, &year, &years))
        .await?;
    Ok(())
}

async fn render_all_payments_page(
    bot: &Bot,
    state: &AppState,
    invoker: u64,
    index: usize,
) -> Result<Option<(String, InlineKeyboardMarkup)>> {
    let year = OffsetDateTime::now_utc().year().to_string();
    let page = {
        let year = year.clone();
        state
            .with_doc(move |doc| {
                let ids: Vec<String> = doc.users.keys().cloned().collect();
                if ids.is_empty() {
                    return None;
                }
                let i = index % ids.len();
                let uid = ids[i].clone();
                let payments = get_user_payments(doc, &uid, &year);
                Some((ids.len(), i, uid, payments))
            })
            .await?
    };
    let Some((total, i, uid, payments)) = page else {
        return Ok(None);
    };
    let name = display_name_for_key(bot, &uid).await;
    let text = render_payment_table(&name, &year, &payments);
    Ok(Some((text, admin_nav_keyboard(invoker, i, total))))
}

async fn handle_list_all_payments(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    user: &User,
) -> Result<()> {
    if !state.is_admin(user) {
        bot.send_message(msg.chat.id, "Only administrators can list all payments.")
            .await?;
        return Ok(());
    }
    match render_all_payments_page(bot, state, user.id.0, 0).await? {
        Some((text, kb)) => {
            bot.send_message(msg.chat.id, text).reply_markup(kb).await?;
        }
        None => {
            bot.send_message(msg.chat.id, "No registered users.").await?;
        }
    }
    Ok(())
}

async fn handle_test_reminder(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    user: &User,
) -> Result<()> {
    if !state.is_admin(user) {
        bot.send_message(msg.chat.id, "Only administrators can send test reminders.")
            .await?;
        return Ok(());
    }
    let settings = state.current_settings().await;
    if settings.lembrete_channel_id.is_none() {
        bot.send_message(
            msg.chat.id,
            "Reminders channel not set. Please use /set_reminder_channel first.",
        )
        .await?;
        return Ok(());
    }

    let now = OffsetDateTime::now_utc();
    let year = now.year().to_string();
    let month_idx = current_month_index(now);
    let sent = send_month_reminders(bot, state, &year, month_idx, Some("[TEST] ")).await?;
    bot.send_message(
        msg.chat.id,
        format!(
            "Test reminder sent to {} user(s) with {} unpaid.",
            sent,
            capitalize(MONTHS[month_idx])
        ),
    )
    .await?;
    Ok(())
}

async fn handle_set_channel(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    user: &User,
    kind: ChannelKind,
    raw: &str,
) -> Result<()> {
    if !state.is_admin(user) {
        bot.send_message(msg.chat.id, "Only administrators can configure channels.")
            .await?;
        return Ok(());
    }
    let target: i64 = if raw.trim().is_empty() {
        msg.chat.id.0
    } else {
        match raw.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                bot.send_message(
                    msg.chat.id,
                    "That is not a valid chat id. Pass a numeric id or run the command in the target chat.",
                )
                .await?;
                return Ok(());
            }
        }
    };
    set_channel(state, kind, target).await?;
    info!("{} channel set to {}", kind.label(), target);
    bot.send_message(
        msg.chat.id,
        format!("{} channel set to {}.", kind.label(), target),
    )
    .await?;
    Ok(())
}

// --- callbacks ---

async fn handle_callback(bot: Bot, state: AppState, q: CallbackQuery) -> Result<()> {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    bot.answer_callback_query(q.id.clone()).await?;

    if let Some(rest) = data.strip_prefix("claim:") {
        return handle_claim_button(&bot, &state, &q, rest).await;
    }
    if let Some(rest) = data.strip_prefix("dismiss:") {
        return handle_dismiss_button(&bot, &q, rest).await;
    }
    if let Some(rest) = data.strip_prefix("confirm:") {
        return handle_resolution(&bot, &state, &q, rest, true).await;
    }
    if let Some(rest) = data.strip_prefix("deny:") {
        return handle_resolution(&bot, &state, &q, rest, false).await;
    }
    if let Some(rest) = data.strip_prefix("plist:") {
        return handle_year_nav(&bot, &state, &q, rest).await;
    }
    if let Some(rest) = data.strip_prefix("alist:") {
        return handle_admin_nav(&bot, &state, &q, rest).await;
    }
    if let Some(rest) = data.strip_prefix("pclose:") {
        return handle_close(&bot, &q, rest).await;
    }

    debug!("unhandled callback data: {}", data);
    Ok(())
}

fn parse_user_year(rest: &str) -> Result<(u64, &str, &str)> {
    let mut it = rest.splitn(3, ':');
    let uid = it
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| anyhow!("malformed callback data: {}", rest))?;
    let year = it
        .next()
        .ok_or_else(|| anyhow!("malformed callback data: {}", rest))?;
    Ok((uid, year, it.next().unwrap_or("")))
}

/// Yes button on a reminder: single-month claim by the mentioned user.
async fn handle_claim_button(
    bot: &Bot,
    state: &AppState,
    q: &CallbackQuery,
    rest: &str,
) -> Result<()> {
    let (target, year, tail) = parse_user_year(rest)?;
    let month_idx = tail
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .filter(|i| *i < 12)
        .ok_or_else(|| anyhow!("malformed claim month: {}", rest))?;

    if q.from.id.0 != target {
        bot.send_message(callback_chat(q), "Only the mentioned user can use this button!")
            .await?;
        return Ok(());
    }

    let settings = state.current_settings().await;
    let Some(conf_chat) = settings.confirmation_channel_id.map(ChatId) else {
        bot.send_message(
            callback_chat(q),
            "Confirmation channel not found. Please contact an administrator.",
        )
        .await?;
        return Ok(());
    };

    let uid = target.to_string();
    let month = MONTHS[month_idx];
    let split = {
        let uid = uid.clone();
        let year = year.to_string();
        state
            .with_doc(move |doc| stage_claim(doc, &uid, &year, &[month_idx]))
            .await?
    };

    if !split.already_paid.is_empty() {
        edit_callback_message(
            bot,
            q,
            format!("{}/{} is already marked as paid.", capitalize(month), year),
            None,
        )
        .await?;
        return Ok(());
    }
    if split.staged.is_empty() {
        // Duplicate press while a claim is in flight.
        return Ok(());
    }

    let conf_text = format!(
        "{} marked {}/{} as paid. Administrator, please confirm:",
        q.from.full_name(),
        capitalize(month),
        year
    );
    let conf_msg = match bot
        .send_message(conf_chat, conf_text)
        .reply_markup(confirm_keyboard(target, year, &[month_idx]))
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!("confirmation dispatch failed for user {}: {:?}", uid, e);
            let uid = uid.clone();
            let year = year.to_string();
            state
                .with_doc(move |doc| unstage_claim(doc, &uid, &year, &[month_idx]))
                .await?;
            bot.send_message(
                callback_chat(q),
                "Confirmation channel not found. Please contact an administrator.",
            )
            .await?;
            return Ok(());
        }
    };

    edit_callback_message(
        bot,
        q,
        format!(
            "Payment intention for {} registered! Awaiting admin confirmation.",
            capitalize(month)
        ),
        None,
    )
    .await?;

    let conf_ref = MsgRef::of(&conf_msg);
    let year = year.to_string();
    state
        .with_doc(move |doc| attach_claim_refs(doc, &uid, &year, &[month_idx], conf_ref, None))
        .await?;
    Ok(())
}

async fn handle_dismiss_button(bot: &Bot, q: &CallbackQuery, rest: &str) -> Result<()> {
    let target: u64 = rest
        .parse()
        .map_err(|_| anyhow!("malformed callback data: {}", rest))?;
    if q.from.id.0 != target {
        bot.send_message(callback_chat(q), "Only the mentioned user can use this button!")
            .await?;
        return Ok(());
    }
    edit_callback_message(bot, q, "Payment action ignored.".to_string(), None).await
}

/// Admin confirm/deny over a claim batch.
async fn handle_resolution(
    bot: &Bot,
    state: &AppState,
    q: &CallbackQuery,
    rest: &str,
    approve: bool,
) -> Result<()> {
    let (target, year, tail) = parse_user_year(rest)?;
    let idxs = parse_months_data(tail);
    if idxs.is_empty() {
        return Err(anyhow!("malformed resolution months: {}", rest));
    }

    let authorized = state.is_admin(&q.from);
    let uid = target.to_string();
    let resolved = {
        let uid = uid.clone();
        let year = year.to_string();
        state
            .with_doc(move |doc| {
                resolve_pending_authorized(doc, authorized, &uid, &year, &idxs, approve)
            })
            .await?
    };
    let Some(resolved) = resolved else {
        bot.send_message(callback_chat(q), "Only administrators can confirm payments!")
            .await?;
        return Ok(());
    };
    if resolved.is_empty() {
        edit_callback_message(bot, q, "Nothing pending for that request.".to_string(), None)
            .await?;
        return Ok(());
    }

    let verdict = if approve { "accepted" } else { "denied" };
    for r in &resolved {
        let month = capitalize(MONTHS[r.month_idx]);
        if let Some(m) = r.entry.confirmation_message_id {
            edit_ref(
                bot,
                m,
                format!("Payment for {}/{} {} by admin.", month, year, verdict),
            )
            .await;
        }
        if let Some(m) = r.entry.response_message_id {
            edit_ref(
                bot,
                m,
                format!(
                    "Payment intention for {} registered! Admin {} the confirmation.",
                    month, verdict
                ),
            )
            .await;
        }
    }

    let label = resolved
        .iter()
        .map(|r| capitalize(MONTHS[r.month_idx]))
        .collect::<Vec<_>>()
        .join(", ");
    let name = display_name(bot, target).await;
    let outcome = if approve { "confirmed" } else { "denied" };
    edit_callback_message(
        bot,
        q,
        format!("Payment for {}/{} from {} {}!", label, year, name, outcome),
        None,
    )
    .await?;
    Ok(())
}

async fn handle_year_nav(bot: &Bot, state: &AppState, q: &CallbackQuery, rest: &str) -> Result<()> {
    let (target, year, _) = parse_user_year(rest)?;
    if q.from.id.0 != target {
        bot.send_message(
            callback_chat(q),
            "Only the user who executed the command can use this button!",
        )
        .await?;
        return Ok(());
    }

    let uid = target.to_string();
    let (payments, years) = {
        let uid = uid.clone();
        let year = year.to_string();
        state
            .with_doc(move |doc| {
                let payments = get_user_payments(doc, &uid, &year);
                let years: Vec<String> = doc
                    .users
                    .get(&uid)
                    .map(|h| h.keys().cloned().collect())
                    .unwrap_or_default();
                (payments, years)
            })
            .await?
    };

    let text = render_payment_table(&q.from.full_name(), year, &payments);
    edit_callback_message(bot, q, text, Some(year_nav_keyboard(target, year, &years))).await
}

async fn handle_admin_nav(bot: &Bot, state: &AppState, q: &CallbackQuery, rest: &str) -> Result<()> {
    let mut it = rest.splitn(2, ':');
    let invoker: u64 = it
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| anyhow!("malformed callback data: {}", rest))?;
    let index: usize = it.next().and_then(|t| t.parse().ok()).unwrap_or(0);

    if q.from.id.0 != invoker || !state.is_admin(&q.from) {
        bot.send_message(
            callback_chat(q),
            "Only the user who executed the command can use this button!",
        )
        .await?;
        return Ok(());
    }

    match render_all_payments_page(bot, state, invoker, index).await? {
        Some((text, kb)) => edit_callback_message(bot, q, text, Some(kb)).await,
        None => edit_callback_message(bot, q, "No registered users.".to_string(), None).await,
    }
}

async fn handle_close(bot: &Bot, q: &CallbackQuery, rest: &str) -> Result<()> {
    let invoker: u64 = rest
        .parse()
        .map_err(|_| anyhow!("malformed callback data: {}", rest))?;
    if q.from.id.0 != invoker {
        bot.send_message(
            callback_chat(q),
            "Only the user who executed the command can use this button!",
        )
        .await?;
        return Ok(());
    }
    if let Some(msg) = q.message.as_ref().and_then(|m| m.regular_message()) {
        bot.delete_message(msg.chat.id, msg.id).await?;
    }
    Ok(())
}

// --- scheduled jobs ---

async fn sleep_until_next_utc_midnight() {
    let now = OffsetDateTime::now_utc();
    let wait = match now.date().next_day() {
        Some(d) => d.midnight().assume_utc() - now,
        None => time::Duration::hours(24),
    };
    let wait = std::time::Duration::try_from(wait).unwrap_or(std::time::Duration::from_secs(60));
    tokio::time::sleep(wait).await;
}

/// Day 13: yearly reset in January, then reminders with a claim button for
/// every user with the current month unpaid.
async fn due_reminder_job(bot: &Bot, state: &AppState) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    if now.day() != REMINDER_DAY {
        return Ok(());
    }
    let year = now.year().to_string();
    if now.month() == Month::January {
        let y = year.clone();
        state.with_doc(move |doc| reset_all_payments(doc, &y)).await?;
        info!("yearly ledger reset persisted");
    }
    let sent = send_month_reminders(bot, state, &year, current_month_index(now), None).await?;
    info!("due-reminder job sent {} reminder(s)", sent);
    Ok(())
}

/// Day 15: overdue notice, no claim button.
async fn overdue_job(bot: &Bot, state: &AppState) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    if now.day() != OVERDUE_DAY {
        return Ok(());
    }
    let year = now.year().to_string();
    let month_idx = current_month_index(now);
    let month = MONTHS[month_idx];

    let unpaid = collect_unpaid(state, &year, month).await?;
    let settings = state.current_settings().await;
    let reminder_chat = settings.lembrete_channel_id.map(ChatId);

    let mut sent = 0usize;
    for uid in unpaid {
        let numeric: u64 = match uid.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("skipping non-numeric user id {:?}", uid);
                continue;
            }
        };
        let name = display_name(bot, numeric).await;
        let text = format!(
            "{}, the subscription payment for {}/{} is overdue! Please send the money ASAP.",
            name,
            capitalize(month),
            year
        );
        let target = reminder_chat.unwrap_or(ChatId(numeric as i64));
        if let Err(e) = bot.send_message(target, text).await {
            warn!("overdue notice for user {} skipped: {:?}", uid, e);
            continue;
        }
        sent += 1;
    }
    info!("overdue job sent {} notice(s)", sent);
    Ok(())
}

/// Day 1: one ✅/❌ line per user for the month that just ended. Skipped
/// silently when no reminders chat is configured.
async fn monthly_summary_job(bot: &Bot, state: &AppState) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    if now.day() != SUMMARY_DAY {
        return Ok(());
    }
    let settings = state.current_settings().await;
    let Some(chat) = settings.lembrete_channel_id.map(ChatId) else {
        debug!("monthly summary skipped: no reminders channel");
        return Ok(());
    };

    let (year, month_idx) = previous_month(now);
    let month = MONTHS[month_idx];
    let statuses: Vec<(String, bool)> = {
        let year = year.clone();
        state
            .with_doc(move |doc| {
                let ids: Vec<String> = doc.users.keys().cloned().collect();
                ids.into_iter()
                    .map(|uid| {
                        let paid = is_month_paid(doc, &uid, &year, month);
                        (uid, paid)
                    })
                    .collect()
            })
            .await?
    };

    let mut text = format!("📊 Payment summary for {}/{}\n", capitalize(month), year);
    for (uid, paid) in statuses {
        let name = display_name_for_key(bot, &uid).await;
        text.push_str(&format!("{}: {}\n", name, if paid { "✅" } else { "❌" }));
    }
    bot.send_message(chat, text).await?;
    Ok(())
}

async fn collect_unpaid(state: &AppState, year: &str, month: &'static str) -> Result<Vec<String>> {
    let year = year.to_string();
    state
        .with_doc(move |doc| {
            let ids: Vec<String> = doc.users.keys().cloned().collect();
            let mut unpaid = Vec::new();
            for uid in ids {
                ensure_user_month(doc, &uid, &year, month);
                if !is_month_paid(doc, &uid, &year, month) {
                    unpaid.push(uid);
                }
            }
            unpaid
        })
        .await
}

/// Shared by the day-13 job and /test_reminder. Targets the reminders chat
/// when configured, otherwise each user's DM. Per-user failures are logged
/// and skipped so one unresolvable user never aborts the loop.
async fn send_month_reminders(
    bot: &Bot,
    state: &AppState,
    year: &str,
    month_idx: usize,
    prefix: Option<&str>,
) -> Result<usize> {
    let month = MONTHS[month_idx];
    let unpaid = collect_unpaid(state, year, month).await?;
    let settings = state.current_settings().await;
    let reminder_chat = settings.lembrete_channel_id.map(ChatId);

    let mut sent = 0usize;
    for uid in unpaid {
        let numeric: u64 = match uid.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("skipping non-numeric user id {:?}", uid);
                continue;
            }
        };
        let name = display_name(bot, numeric).await;
        let text = format!(
            "{}{}, tomorrow is the subscription payment day for {}/{}. Have you sent the money?",
            prefix.unwrap_or(""),
            name,
            capitalize(month),
            year
        );
        let target = reminder_chat.unwrap_or(ChatId(numeric as i64));
        if let Err(e) = bot
            .send_message(target, text)
            .reply_markup(claim_keyboard(numeric, year, month_idx))
            .await
        {
            warn!("reminder for user {} skipped: {:?}", uid, e);
            continue;
        }
        sent += 1;
    }
    Ok(sent)
}

fn spawn_daily_jobs(bot: Bot, state: AppState) {
    {
        let bot = bot.clone();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                sleep_until_next_utc_midnight().await;
                if let Err(e) = due_reminder_job(&bot, &state).await {
                    error!("due-reminder job failed: {:?}", e);
                }
            }
        });
    }
    {
        let bot = bot.clone();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                sleep_until_next_utc_midnight().await;
                if let Err(e) = overdue_job(&bot, &state).await {
                    error!("overdue job failed: {:?}", e);
                }
            }
        });
    }
    tokio::spawn(async move {
        loop {
            sleep_until_next_utc_midnight().await;
            if let Err(e) = monthly_summary_job(&bot, &state).await {
                error!("monthly summary job failed: {:?}", e);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    pretty_env_logger::init();

    let token = env::var("TG_BOT_TOKEN").context("Missing TG_BOT_TOKEN")?;
    let admin_id: u64 = env::var("BOT_ADMIN_ID")
        .context("Missing BOT_ADMIN_ID")?
        .parse()
        .context("BOT_ADMIN_ID must be a numeric Telegram user id")?;
    let path = env::var("PAYMENTS_FILE").unwrap_or_else(|_| "payments.json".to_string());

    let bot = Bot::new(token);
    let me = bot.get_me().await.context("get_me failed")?;

    let store = Arc::new(Store::new(path));
    let doc = store.load().await;
    let settings = doc.settings.clone();
    info!(
        "settings loaded: reminders={:?} commands={:?} confirmation={:?}",
        settings.lembrete_channel_id, settings.commands_channel_id, settings.confirmation_channel_id
    );

    let state = AppState {
        store,
        settings: Arc::new(RwLock::new(settings)),
        admin_id: UserId(admin_id),
        bot_username: me.username().to_string(),
    };

    spawn_daily_jobs(bot.clone(), state.clone());
    info!("Bot online as @{}. Admin id: {}", state.bot_username, admin_id);

    let handler = dptree::entry()
        .branch(
            Update::filter_message().endpoint(|bot: Bot, state: AppState, msg: Message| async move {
                if let Err(e) = handle_message(bot, state, msg).await {
                    error!("message handler error: {:?}", e);
                }
                Ok::<(), anyhow::Error>(())
            }),
        )
        .branch(Update::filter_callback_query().endpoint(
            |bot: Bot, state: AppState, q: CallbackQuery| async move {
                if let Err(e) = handle_callback(bot, state, q).await {
                    error!("callback handler error: {:?}", e);
                }
                Ok::<(), anyhow::Error>(())
            },
        ));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;
    use time::Date;

    fn callbacks(kb: &InlineKeyboardMarkup) -> Vec<String> {
        kb.inline_keyboard
            .iter()
            .flatten()
            .filter_map(|b| match &b.kind {
                InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn utc(year: i32, month: Month, day: u8) -> OffsetDateTime {
        Date::from_calendar_date(year, month, day)
            .unwrap()
            .midnight()
            .assume_utc()
    }

    #[test]
    fn month_normalization_accepts_both_locales() {
        assert_eq!(canonical_month("março"), Some("março"));
        assert_eq!(canonical_month("March"), Some("março"));
        assert_eq!(canonical_month("  DECEMBER "), Some("dezembro"));
        assert_eq!(canonical_month("smarch"), None);
        assert_eq!(month_index("janeiro"), Some(0));
        assert_eq!(month_index("december"), Some(11));
    }

    #[test]
    fn get_user_payments_defaults_to_twelve_unpaid_months() {
        let mut doc = PaymentsDoc::default();
        let payments = get_user_payments(&mut doc, "42", "2024");
        assert_eq!(payments.len(), 12);
        for month in MONTHS {
            assert_eq!(payments.get(month), Some(&false), "missing {}", month);
        }
    }

    #[test]
    fn is_month_paid_creates_missing_entries() {
        let mut doc = PaymentsDoc::default();
        assert!(!is_month_paid(&mut doc, "42", "2024", "march"));
        let payments = get_user_payments(&mut doc, "42", "2024");
        assert_eq!(payments.len(), 12);
        assert_eq!(payments.get("março"), Some(&false));
    }

    #[test]
    fn set_payment_status_marks_single_month() {
        let mut doc = PaymentsDoc::default();
        set_payment_status(&mut doc, "42", "2024", "maio", true);
        assert!(is_month_paid(&mut doc, "42", "2024", "may"));
        assert!(!is_month_paid(&mut doc, "42", "2024", "june"));
    }

    #[test]
    fn stage_claim_records_pending_and_reports_paid_months() {
        let mut doc = PaymentsDoc::default();
        set_payment_status(&mut doc, "42", "2024", "janeiro", true);
        let split = stage_claim(&mut doc, "42", "2024", &[0, 1]);
        assert_eq!(split.staged, vec![1]);
        assert_eq!(split.already_paid, vec![0]);
        assert!(split.already_pending.is_empty());
        assert!(doc.pending_payments["42"]["2024"].contains_key("fevereiro"));
    }

    #[test]
    fn second_claim_for_pending_month_is_noop() {
        let mut doc = PaymentsDoc::default();
        let first = stage_claim(&mut doc, "42", "2024", &[2]);
        assert_eq!(first.staged, vec![2]);
        let second = stage_claim(&mut doc, "42", "2024", &[2]);
        assert!(second.staged.is_empty());
        assert_eq!(second.already_pending, vec![2]);
        assert_eq!(doc.pending_payments["42"]["2024"].len(), 1);
    }

    #[test]
    fn approve_commits_ledger_and_clears_pending() {
        let mut doc = PaymentsDoc::default();
        let split = stage_claim(&mut doc, "42", "2024", &[2]);
        assert_eq!(split.staged, vec![2]);
        let conf = MsgRef {
            chat_id: -100,
            message_id: 7,
        };
        let resp = MsgRef {
            chat_id: 55,
            message_id: 8,
        };
        attach_claim_refs(&mut doc, "42", "2024", &[2], conf, Some(resp));
        assert_eq!(
            doc.pending_payments["42"]["2024"]["março"].confirmation_message_id,
            Some(conf)
        );
        assert_eq!(
            doc.pending_payments["42"]["2024"]["março"].response_message_id,
            Some(resp)
        );

        let resolved = resolve_pending(&mut doc, "42", "2024", &[2], true);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].month_idx, 2);
        assert_eq!(resolved[0].entry.confirmation_message_id, Some(conf));

        let payments = get_user_payments(&mut doc, "42", "2024");
        assert_eq!(payments.get("março"), Some(&true));
        assert!(!doc.pending_payments.contains_key("42"));
    }

    #[test]
    fn deny_discards_pending_without_payment() {
        let mut doc = PaymentsDoc::default();
        stage_claim(&mut doc, "42", "2024", &[3]);
        let resolved = resolve_pending(&mut doc, "42", "2024", &[3], false);
        assert_eq!(resolved.len(), 1);
        assert!(!is_month_paid(&mut doc, "42", "2024", "abril"));
        assert!(!doc.pending_payments.contains_key("42"));
    }

    #[test]
    fn resolution_skips_months_without_pending_records() {
        let mut doc = PaymentsDoc::default();
        stage_claim(&mut doc, "42", "2024", &[5]);
        let resolved = resolve_pending(&mut doc, "42", "2024", &[4, 5, 6], true);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].month_idx, 5);
        assert!(is_month_paid(&mut doc, "42", "2024", "junho"));
        assert!(!is_month_paid(&mut doc, "42", "2024", "maio"));
    }

    #[test]
    fn unauthorized_resolution_leaves_document_untouched() {
        let mut doc = PaymentsDoc::default();
        stage_claim(&mut doc, "42", "2024", &[2]);
        let before = doc.clone();

        let denied = resolve_pending_authorized(&mut doc, false, "42", "2024", &[2], true);
        assert!(denied.is_none());
        assert_eq!(
            serde_json::to_string(&doc).unwrap(),
            serde_json::to_string(&before).unwrap()
        );
        assert!(doc.pending_payments["42"]["2024"].contains_key("março"));
        assert!(!is_month_paid(&mut doc, "42", "2024", "março"));

        let granted = resolve_pending_authorized(&mut doc, true, "42", "2024", &[2], true);
        assert_eq!(granted.map(|r| r.len()), Some(1));
        assert!(is_month_paid(&mut doc, "42", "2024", "março"));
    }

    fn plain_user(id: u64) -> User {
        User {
            id: UserId(id),
            is_bot: false,
            first_name: "Ana".to_string(),
            last_name: None,
            username: None,
            language_code: None,
            is_premium: false,
            added_to_attachment_menu: false,
        }
    }

    #[tokio::test]
    async fn is_admin_matches_configured_id_only() {
        let state = AppState {
            store: Arc::new(temp_store("admin-gate")),
            settings: Arc::new(RwLock::new(Settings::default())),
            admin_id: UserId(99),
            bot_username: "mensalidade_bot".to_string(),
        };
        assert!(state.is_admin(&plain_user(99)));
        assert!(!state.is_admin(&plain_user(42)));
    }

    #[test]
    fn unstage_claim_reverts_staged_months() {
        let mut doc = PaymentsDoc::default();
        stage_claim(&mut doc, "42", "2024", &[7]);
        unstage_claim(&mut doc, "42", "2024", &[7]);
        assert!(!doc.pending_payments.contains_key("42"));
        let again = stage_claim(&mut doc, "42", "2024", &[7]);
        assert_eq!(again.staged, vec![7]);
    }

    #[test]
    fn reset_discards_all_prior_history() {
        let mut doc = PaymentsDoc::default();
        set_payment_status(&mut doc, "7", "2023", "janeiro", true);
        set_payment_status(&mut doc, "7", "2024", "fevereiro", true);
        reset_all_payments(&mut doc, "2025");

        let history = &doc.users["7"];
        assert_eq!(history.len(), 1);
        let months = &history["2025"];
        assert_eq!(months.len(), 12);
        assert!(months.values().all(|paid| !paid));
    }

    #[test]
    fn document_roundtrip_keeps_reserved_keys_and_users() {
        let mut doc = PaymentsDoc::default();
        doc.settings.lembrete_channel_id = Some(-1001);
        set_payment_status(&mut doc, "42", "2024", "março", true);
        stage_claim(&mut doc, "42", "2024", &[4]);

        let json = serde_json::to_string(&doc).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["settings"]["lembrete_channel_id"], "-1001");
        assert_eq!(value["42"]["2024"]["março"], true);
        assert!(value["pending_payments"]["42"]["2024"]["maio"].is_object());

        let mut back: PaymentsDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.settings.lembrete_channel_id, Some(-1001));
        assert!(is_month_paid(&mut back, "42", "2024", "março"));
        assert!(back.pending_payments["42"]["2024"].contains_key("maio"));
    }

    #[test]
    fn settings_accept_numeric_and_string_channel_ids() {
        let s: Settings = serde_json::from_str(
            r#"{"lembrete_channel_id": -5, "commands_channel_id": "99", "confirmation_channel_id": null}"#,
        )
        .unwrap();
        assert_eq!(s.lembrete_channel_id, Some(-5));
        assert_eq!(s.commands_channel_id, Some(99));
        assert_eq!(s.confirmation_channel_id, None);

        let empty: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, Settings::default());
    }

    #[test]
    fn previous_month_rolls_back_year_in_january() {
        let (year, idx) = previous_month(utc(2025, Month::January, 1));
        assert_eq!(year, "2024");
        assert_eq!(MONTHS[idx], "dezembro");

        let (year, idx) = previous_month(utc(2024, Month::July, 1));
        assert_eq!(year, "2024");
        assert_eq!(MONTHS[idx], "junho");
    }

    #[test]
    fn claim_keyboard_targets_the_claiming_user() {
        let kb = claim_keyboard(42, "2024", 2);
        let data = callbacks(&kb);
        assert!(data.contains(&"claim:42:2024:3".to_string()));
        assert!(data.contains(&"dismiss:42".to_string()));
    }

    #[test]
    fn confirm_keyboard_encodes_batch_months() {
        let kb = confirm_keyboard(42, "2024", &[0, 1, 11]);
        let data = callbacks(&kb);
        assert!(data.contains(&"confirm:42:2024:1,2,12".to_string()));
        assert!(data.contains(&"deny:42:2024:1,2,12".to_string()));
    }

    #[test]
    fn year_nav_keyboard_bounds_navigation_to_known_years() {
        let years = vec!["2022".to_string(), "2023".to_string(), "2024".to_string()];
        let data = callbacks(&year_nav_keyboard(42, "2023", &years));
        assert!(data.contains(&"plist:42:2022".to_string()));
        assert!(data.contains(&"plist:42:2024".to_string()));
        assert!(data.contains(&"pclose:42".to_string()));

        let edge = callbacks(&year_nav_keyboard(42, "2022", &years));
        assert!(!edge.iter().any(|d| d.ends_with(":2021")));
        assert!(edge.contains(&"plist:42:2023".to_string()));
    }

    #[test]
    fn resolution_data_roundtrip() {
        let (uid, year, tail) = parse_user_year("42:2024:1,2,12").unwrap();
        assert_eq!(uid, 42);
        assert_eq!(year, "2024");
        assert_eq!(parse_months_data(tail), vec![0, 1, 11]);
        assert!(parse_user_year("nonsense").is_err());
        assert!(parse_months_data("0,13,zzz").is_empty());
    }

    fn temp_store(name: &str) -> Store {
        let path = std::env::temp_dir().join(format!(
            "mensalidade-test-{}-{}.json",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        Store::new(path)
    }

    #[tokio::test]
    async fn store_load_recovers_from_corrupt_file() {
        let store = temp_store("corrupt");
        tokio::fs::write(&store.path, "{not json at all")
            .await
            .unwrap();

        let doc = store.load().await;
        assert!(doc.users.is_empty());
        assert!(doc.pending_payments.is_empty());
        assert_eq!(doc.settings, Settings::default());

        // The reset was persisted, so the next load parses cleanly.
        let raw = tokio::fs::read_to_string(&store.path).await.unwrap();
        let reparsed: PaymentsDoc = serde_json::from_str(&raw).unwrap();
        assert!(reparsed.users.is_empty());
    }

    #[tokio::test]
    async fn store_missing_file_yields_default_document() {
        let store = temp_store("missing");
        let doc = store.load().await;
        assert!(doc.users.is_empty());
        assert_eq!(doc.settings, Settings::default());
    }

    #[tokio::test]
    async fn store_update_persists_settings_with_document() {
        let store = temp_store("update");
        let settings = Settings {
            lembrete_channel_id: Some(-100555),
            ..Settings::default()
        };

        store
            .update(&settings, |doc| {
                ensure_user_month(doc, "42", "2024", "janeiro")
            })
            .await
            .unwrap();

        let doc = store.load().await;
        assert_eq!(doc.settings.lembrete_channel_id, Some(-100555));
        assert_eq!(doc.users["42"]["2024"].len(), 12);

        let raw = tokio::fs::read_to_string(&store.path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["settings"]["lembrete_channel_id"], "-100555");
    }
}
