use std::collections::HashMap;

use orchestrator_core::{
    JobMessage, JobPayload, OrchestratorError, OrchestratorResult, DEAD_LETTER_JOB_TYPE,
};

type PayloadValidator = Box<dyn Fn(&JobMessage) -> OrchestratorResult<()> + Send + Sync>;

/// 作业类型到负载校验器的注册表
///
/// 未注册的作业类型只做信封校验；开启 `strict` 后直接拒绝。
#[derive(Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, PayloadValidator>,
    strict: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 拒绝未注册作业类型的注册表
    pub fn strict() -> Self {
        Self {
            validators: HashMap::new(),
            strict: true,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// 注册带类型的负载，重复注册覆盖旧校验器
    pub fn register<P: JobPayload + 'static>(&mut self) -> &mut Self {
        let validator: PayloadValidator = Box::new(|message: &JobMessage| {
            let payload = message.payload_as::<P>()?;
            payload
                .validate()
                .map_err(|e| OrchestratorError::Validation(format!("{}: {e}", P::JOB_TYPE)))
        });
        self.validators.insert(P::JOB_TYPE.to_string(), validator);
        self
    }

    pub fn with<P: JobPayload + 'static>(mut self) -> Self {
        self.register::<P>();
        self
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.validators.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.validators.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn validate(&self, message: &JobMessage) -> OrchestratorResult<()> {
        message.validate()?;

        match self.validators.get(&message.job_type) {
            Some(validator) => validator(message),
            // 死信记录由代理生成，不参与业务校验
            None if message.job_type == DEAD_LETTER_JOB_TYPE => Ok(()),
            None if self.strict => Err(OrchestratorError::Validation(format!(
                "未注册的作业类型: {}",
                message.job_type
            ))),
            None => Ok(()),
        }
    }
}
