//! Cycle orchestrator — one full pass over every enabled account.
//!
//! Accounts are isolated from each other: a failure (bad credentials, login
//! refusal, rate-limit abort) is recorded on that account's settings rows and
//! the cycle moves on to the next account.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::outreach::{OutreachEngine, OutreachReport};
use super::reply::{ReplyEngine, ReplyReport};
use crate::error::Error;
use crate::gateway::GatewayFactory;
use crate::llm::ReplyGenerator;
use crate::secrets::CredentialVault;
use crate::store::{Account, AccountStore, Database, OutreachProgram, ReplyPolicy, SettingsStore};

#[derive(Debug, Default)]
pub struct CycleReport {
    pub accounts: u32,
    pub account_failures: u32,
    pub replies_sent: u32,
    pub outreach_sends: u32,
    pub drips_stopped: u32,
    pub drips_completed: u32,
}

pub struct Orchestrator {
    accounts: AccountStore,
    settings: SettingsStore,
    vault: Arc<dyn CredentialVault>,
    factory: Arc<dyn GatewayFactory>,
    reply_engine: ReplyEngine,
    outreach_engine: OutreachEngine,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        vault: Arc<dyn CredentialVault>,
        factory: Arc<dyn GatewayFactory>,
        generator: Arc<dyn ReplyGenerator>,
        auto_approve_pending: bool,
    ) -> Self {
        Self {
            accounts: AccountStore::new(Arc::clone(&db)),
            settings: SettingsStore::new(Arc::clone(&db)),
            vault,
            factory,
            reply_engine: ReplyEngine::new(Arc::clone(&db), generator, auto_approve_pending),
            outreach_engine: OutreachEngine::new(db),
        }
    }

    /// Run one cycle over every account with an enabled policy or program.
    pub async fn run_once(&self) -> Result<CycleReport, Error> {
        let mut by_account: BTreeMap<String, (Option<ReplyPolicy>, Option<OutreachProgram>)> =
            BTreeMap::new();
        for policy in self.settings.enabled_reply_policies()? {
            let key = policy.account_id.clone();
            by_account.entry(key).or_default().0 = Some(policy);
        }
        for program in self.settings.enabled_programs()? {
            let key = program.account_id.clone();
            by_account.entry(key).or_default().1 = Some(program);
        }

        let mut report = CycleReport::default();
        for (account_id, (policy, program)) in &by_account {
            report.accounts += 1;
            match self
                .run_account(account_id, policy.as_ref(), program.as_ref())
                .await
            {
                Ok((replies, outreach)) => {
                    report.replies_sent += replies.replies_sent;
                    report.outreach_sends += outreach.sends;
                    report.drips_stopped += outreach.stopped;
                    report.drips_completed += outreach.completed;
                }
                Err(e) => {
                    warn!(account = account_id.as_str(), error = %e, "Account cycle failed");
                    report.account_failures += 1;
                    let text = e.to_string();
                    if let Some(policy) = policy {
                        self.settings.set_policy_error(&policy.id, &text)?;
                    }
                    if let Some(program) = program {
                        self.settings.set_program_error(&program.id, &text)?;
                    }
                }
            }
        }
        info!(
            accounts = report.accounts,
            failures = report.account_failures,
            replies = report.replies_sent,
            sends = report.outreach_sends,
            "Cycle finished"
        );
        Ok(report)
    }

    async fn run_account(
        &self,
        account_id: &str,
        policy: Option<&ReplyPolicy>,
        program: Option<&OutreachProgram>,
    ) -> Result<(ReplyReport, OutreachReport), Error> {
        let Some(account) = self.accounts.get(account_id)? else {
            warn!(account = account_id, "Settings reference a deleted account, skipping");
            return Ok((ReplyReport::default(), OutreachReport::default()));
        };

        let credentials = self.vault.load(&account.id)?;
        let gateway = self.factory.gateway_for(&account.username);
        let session = gateway.authenticate(&account.username, &credentials).await?;
        self.persist_session(&account, &credentials.session, &session.session, &session.user_id)?;

        let mut reply_report = ReplyReport::default();
        if let Some(policy) = policy {
            self.settings.mark_policy_run(&policy.id)?;
            reply_report = self
                .reply_engine
                .run_for_account(&account, &session.user_id, policy, gateway.as_ref())
                .await?;
        }

        let mut outreach_report = OutreachReport::default();
        if let Some(program) = program {
            self.settings.mark_program_run(&program.id)?;
            outreach_report = self
                .outreach_engine
                .run_for_account(&account, &session.user_id, program, gateway.as_ref())
                .await?;
        }

        Ok((reply_report, outreach_report))
    }

    fn persist_session(
        &self,
        account: &Account,
        previous: &Option<String>,
        refreshed: &Option<String>,
        user_id: &str,
    ) -> Result<(), Error> {
        if account.platform_user_id.as_deref() != Some(user_id) {
            self.accounts.set_platform_user_id(&account.id, user_id)?;
        }
        if let Some(session) = refreshed {
            if previous.as_deref() != Some(session) {
                self.vault.update_session(&account.id, session)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{inbound_msg, ScriptedGateway};
    use crate::gateway::InboxGateway;
    use crate::llm::tests::MockGenerator;
    use crate::secrets::tests::MemoryVault;
    use crate::store::settings::tests::{test_policy, test_program};
    use crate::store::{ContactStore, ProgramStep, RecipientStore, SendLog};

    struct FixedFactory {
        gateway: Arc<ScriptedGateway>,
    }

    impl GatewayFactory for FixedFactory {
        fn gateway_for(&self, _account_username: &str) -> Arc<dyn InboxGateway> {
            Arc::clone(&self.gateway) as Arc<dyn InboxGateway>
        }
    }

    fn orchestrator(
        db: Arc<Database>,
        vault: MemoryVault,
        gateway: Arc<ScriptedGateway>,
        reply: &str,
    ) -> Orchestrator {
        Orchestrator::new(
            db,
            Arc::new(vault),
            Arc::new(FixedFactory { gateway }),
            Arc::new(MockGenerator::replying(reply)),
            false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_replies_and_sends_outreach() {
        let (db, account_id) = crate::store::messages::tests::test_db_with_account();
        let settings = SettingsStore::new(Arc::clone(&db));
        settings.upsert_reply_policy(&test_policy(&account_id)).unwrap();
        settings
            .upsert_program(&test_program(
                &account_id,
                vec![ProgramStep {
                    template: "Hi {username}!".into(),
                    offset_hours: 0,
                }],
            ))
            .unwrap();
        ContactStore::new(Arc::clone(&db))
            .insert("lead", None, None, None, false, false)
            .unwrap();

        let gateway = Arc::new(
            ScriptedGateway::new()
                .with_thread("t1", false, vec![inbound_msg("i1", "hello!", Some(1))]),
        );
        let vault = MemoryVault::with_password(&account_id, "pw");
        let orch = orchestrator(Arc::clone(&db), vault, Arc::clone(&gateway), "welcome!");

        let report = orch.run_once().await.unwrap();

        assert_eq!(report.accounts, 1);
        assert_eq!(report.account_failures, 0);
        assert_eq!(report.replies_sent, 1);
        assert_eq!(report.outreach_sends, 1);
        assert_eq!(gateway.sent_texts(), vec!["welcome!", "Hi lead!"]);

        // Session handed out at login is persisted for the next cycle.
        let creds = crate::secrets::CredentialVault::load(
            orch.vault.as_ref(),
            &account_id,
        )
        .unwrap();
        assert_eq!(creds.session.as_deref(), Some("scripted-session"));

        // last_run stamps are set and last_error stays clear.
        let policy = settings.enabled_reply_policies().unwrap().remove(0);
        assert!(policy.last_run_at.is_some());
        assert!(policy.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_fail_only_that_account() {
        let (db, first_id) = crate::store::messages::tests::test_db_with_account();
        let second_id = AccountStore::new(Arc::clone(&db))
            .insert("second", Some("43"))
            .unwrap();
        let settings = SettingsStore::new(Arc::clone(&db));
        settings.upsert_reply_policy(&test_policy(&first_id)).unwrap();
        settings.upsert_reply_policy(&test_policy(&second_id)).unwrap();

        let gateway = Arc::new(
            ScriptedGateway::new()
                .with_thread("t1", false, vec![inbound_msg("i1", "hi!", Some(1))]),
        );
        // Only the first account has credentials in the vault.
        let vault = MemoryVault::with_password(&first_id, "pw");
        let orch = orchestrator(Arc::clone(&db), vault, gateway, "hey");

        let report = orch.run_once().await.unwrap();
        assert_eq!(report.accounts, 2);
        assert_eq!(report.account_failures, 1);
        assert_eq!(report.replies_sent, 1);

        let failing = settings
            .enabled_reply_policies()
            .unwrap()
            .into_iter()
            .find(|p| p.account_id == second_id)
            .unwrap();
        assert!(failing.last_error.unwrap().contains("No credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_during_replies_skips_outreach_for_account() {
        let (db, account_id) = crate::store::messages::tests::test_db_with_account();
        let settings = SettingsStore::new(Arc::clone(&db));
        settings.upsert_reply_policy(&test_policy(&account_id)).unwrap();
        settings
            .upsert_program(&test_program(
                &account_id,
                vec![ProgramStep {
                    template: "hi".into(),
                    offset_hours: 0,
                }],
            ))
            .unwrap();
        ContactStore::new(Arc::clone(&db))
            .insert("lead", None, None, None, false, false)
            .unwrap();

        let mut scripted = ScriptedGateway::new()
            .with_thread("t1", false, vec![inbound_msg("i1", "hello", Some(1))]);
        scripted.send_error = Some("rate_limit".into());
        let gateway = Arc::new(scripted);
        let vault = MemoryVault::with_password(&account_id, "pw");
        let orch = orchestrator(Arc::clone(&db), vault, gateway, "hey");

        let report = orch.run_once().await.unwrap();
        assert_eq!(report.account_failures, 1);
        assert_eq!(report.outreach_sends, 0);
        // Nothing was enrolled because the outreach pass never started.
        assert!(RecipientStore::new(Arc::clone(&db))
            .get(&account_id, "lead")
            .unwrap()
            .is_none());
        assert_eq!(SendLog::new(db).recent(&account_id, 10).unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn login_refusal_is_recorded_on_settings() {
        let (db, account_id) = crate::store::messages::tests::test_db_with_account();
        let settings = SettingsStore::new(Arc::clone(&db));
        settings.upsert_reply_policy(&test_policy(&account_id)).unwrap();

        let mut scripted = ScriptedGateway::new();
        scripted.auth_error = Some("bad password".into());
        let vault = MemoryVault::with_password(&account_id, "pw");
        let orch = orchestrator(Arc::clone(&db), vault, Arc::new(scripted), "hey");

        let report = orch.run_once().await.unwrap();
        assert_eq!(report.account_failures, 1);
        let policy = settings.enabled_reply_policies().unwrap().remove(0);
        assert!(policy.last_error.unwrap().contains("login_failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn platform_user_id_is_learned_at_login() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let accounts = AccountStore::new(Arc::clone(&db));
        let account_id = accounts.insert("tester", None).unwrap();
        let settings = SettingsStore::new(Arc::clone(&db));
        settings.upsert_reply_policy(&test_policy(&account_id)).unwrap();

        let vault = MemoryVault::with_password(&account_id, "pw");
        let orch = orchestrator(
            Arc::clone(&db),
            vault,
            Arc::new(ScriptedGateway::new()),
            "hey",
        );
        orch.run_once().await.unwrap();

        let account = accounts.get(&account_id).unwrap().unwrap();
        assert_eq!(account.platform_user_id.as_deref(), Some("42"));
    }
}
