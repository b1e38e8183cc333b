use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ahash::AHashMap;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::batch::Batch;
use crate::dictionary::{Dictionary, DictionaryData, FilterSpec};
use crate::phi::{self, DensePhiMatrix, PhiMatrix, TopicModel, DEFAULT_EPS};
use crate::processor::{self, BatchContribution, BatchTask, ProcessorSettings};
use crate::regularizers::{regularize_phi, RegularizerConfig, ThetaRegularizers};
use crate::scores::{calculate_batch_partials, ScoreConfig, ScoreManager, ScorePartial, ScoreValue};
use crate::sync::{BatchManager, BlockingQueue, TaskAwaiter, ThreadSafeHolder};
use crate::theta::{CachedBatchTheta, ThetaCache, ThetaMatrix};
use crate::token::{ClassId, TransactionTypeName};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatrixLayout {
    #[default]
    Dense,
    Sparse,
}

/// Model-wide configuration; see the crate documentation for the meaning
/// of the individual knobs. Weights lists are parallel to their id lists;
/// an empty id list whitelists everything at weight 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterModelConfig {
    pub topic_names: Vec<String>,
    pub class_ids: Vec<ClassId>,
    pub class_weights: Vec<f32>,
    pub transaction_typenames: Vec<TransactionTypeName>,
    pub transaction_weights: Vec<f32>,
    pub pwt_name: String,
    pub nwt_name: String,
    pub num_processors: i32,
    pub num_document_passes: usize,
    pub reuse_theta: bool,
    pub cache_theta: bool,
    pub opt_for_avx: bool,
    pub disk_cache_path: Option<PathBuf>,
    pub ptd_name: Option<String>,
    pub regularizers: Vec<RegularizerConfig>,
    pub scores: Vec<ScoreConfig>,
}

impl Default for MasterModelConfig {
    fn default() -> Self {
        Self {
            topic_names: Vec::new(),
            class_ids: Vec::new(),
            class_weights: Vec::new(),
            transaction_typenames: Vec::new(),
            transaction_weights: Vec::new(),
            pwt_name: "pwt".to_string(),
            nwt_name: "nwt".to_string(),
            num_processors: 0,
            num_document_passes: 10,
            reuse_theta: false,
            cache_theta: false,
            opt_for_avx: true,
            disk_cache_path: None,
            ptd_name: None,
            regularizers: Vec::new(),
            scores: Vec::new(),
        }
    }
}

impl MasterModelConfig {
    pub fn with_topics(topic_names: &[&str]) -> Self {
        Self {
            topic_names: topic_names.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.class_weights.is_empty() && self.class_weights.len() != self.class_ids.len() {
            return Err(Error::InvalidArgument(format!(
                "class_weight size {} != class_id size {}",
                self.class_weights.len(),
                self.class_ids.len()
            )));
        }

        if !self.transaction_weights.is_empty()
            && self.transaction_weights.len() != self.transaction_typenames.len()
        {
            return Err(Error::InvalidArgument(format!(
                "transaction_weight size {} != transaction_typename size {}",
                self.transaction_weights.len(),
                self.transaction_typenames.len()
            )));
        }

        let mut seen = ahash::AHashSet::new();
        for name in &self.topic_names {
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidArgument(format!("duplicate topic {}", name)));
            }
        }

        for regularizer in &self.regularizers {
            regularizer.validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitializeModelArgs {
    /// Defaults to the configured pwt name.
    pub model_name: Option<String>,
    pub dictionary_name: String,
    pub seed: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FitOnlineArgs {
    pub batch_names: Vec<String>,
    pub update_after: Vec<usize>,
    pub apply_weight: Vec<f32>,
    pub decay_weight: Vec<f32>,
    pub asynchronous: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessBatchesArgs {
    pub pwt_source: String,
    /// When set, the accumulated n_wt lands under this name.
    pub nwt_target: Option<String>,
    pub batch_names: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GetTopicModelArgs {
    pub model_name: Option<String>,
    pub topic_names: Option<Vec<String>>,
    pub class_ids: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    pub layout: MatrixLayout,
    pub eps: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct GetThetaMatrixArgs {
    pub topic_names: Option<Vec<String>>,
    pub layout: MatrixLayout,
    pub eps: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeModelArgs {
    pub sources: Vec<(String, f32)>,
    pub target: String,
    pub topic_names: Option<Vec<String>>,
    pub dictionary_name: Option<String>,
}

/// Zero-copy view handle returned by [`MasterModel::attach_model`].
/// Writes through the buffer are observed by subsequent requests; while
/// any handle is alive the matrix's topic axis is frozen.
pub struct PhiAttachment {
    pub buffer: Arc<RwLock<Vec<f32>>>,
    pub token_size: usize,
    pub topic_size: usize,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Default)]
pub struct MasterComponentInfo {
    pub num_processors: usize,
    pub matrices: Vec<(String, usize, usize)>,
    pub dictionaries: Vec<(String, usize)>,
    pub batches: usize,
    pub score_names: Vec<String>,
    pub regularizer_names: Vec<String>,
    pub cached_theta_batches: usize,
}

/// Everything one pass over a set of batches needs, snapshotted so the
/// work can run detached from the master (async fitting keeps processing
/// while a commit is in flight).
struct PassContext {
    phi: Arc<PhiMatrix>,
    batches: Vec<Arc<Batch>>,
    settings: Arc<ProcessorSettings>,
    regularizers: Arc<ThetaRegularizers>,
    ptd: Option<Arc<PhiMatrix>>,
    cached_theta: Vec<Option<Arc<CachedBatchTheta>>>,
    score_configs: Vec<ScoreConfig>,
    dictionaries: Arc<AHashMap<String, Arc<Dictionary>>>,
    accumulate_nwt: bool,
}

type BatchOutput = (BatchContribution, Vec<(String, ScorePartial)>);
type PassOutput = Vec<BatchOutput>;

fn process_one(context: &PassContext, index: usize) -> Option<BatchOutput> {
    let batch = &context.batches[index];
    let phi = context.phi.as_dense()?;

    let task = BatchTask {
        batch,
        phi,
        settings: &context.settings,
        regularizers: &context.regularizers,
        cached_theta: context.cached_theta[index].clone(),
        ptd: context.ptd.as_ref().and_then(|p| p.as_dense()),
        accumulate_nwt: context.accumulate_nwt,
    };

    let contribution = match processor::process_batch(&task) {
        Ok(contribution) => contribution,
        Err(error) => {
            tracing::warn!(
                batch = batch.id.as_str(),
                %error,
                "batch failed, recording zero contribution"
            );
            return None;
        }
    };

    let resolver = |name: &str| context.dictionaries.get(name).cloned();

    let partials = match calculate_batch_partials(
        &context.score_configs,
        batch,
        &contribution,
        phi,
        &context.settings,
        &resolver,
    ) {
        Ok(partials) => partials,
        Err(error) => {
            tracing::warn!(batch = batch.id.as_str(), %error, "score calculation failed");
            Vec::new()
        }
    };

    Some((contribution, partials))
}

/// Runs the E-step over every batch of the context. Workers pull
/// unstarted batch ids from a [`BatchManager`] until the pass drains;
/// results land in per-batch slots so the output keeps submission order
/// no matter which worker finished first. Failed batches contribute
/// nothing.
fn execute_pass(context: &PassContext) -> PassOutput {
    let manager = BatchManager::new(context.batches.iter().map(|b| b.id.clone()));

    // A batch listed twice is processed twice; each hand-out of its id
    // maps back to the next unprocessed position.
    let mut positions: AHashMap<String, std::collections::VecDeque<usize>> = AHashMap::new();
    for (index, batch) in context.batches.iter().enumerate() {
        positions.entry(batch.id.clone()).or_default().push_back(index);
    }
    let positions = Mutex::new(positions);

    let slots: Vec<Mutex<Option<BatchOutput>>> =
        (0..context.batches.len()).map(|_| Mutex::new(None)).collect();

    rayon::scope(|scope| {
        for _ in 0..rayon::current_num_threads().max(1) {
            scope.spawn(|_| {
                while let Some(batch_id) = manager.next() {
                    let index = positions
                        .lock()
                        .unwrap()
                        .get_mut(&batch_id)
                        .and_then(|queue| queue.pop_front());

                    if let Some(index) = index {
                        *slots[index].lock().unwrap() = process_one(context, index);
                    }

                    manager.done(&batch_id);
                }
            });
        }
    });

    debug_assert!(manager.wait_idle(None));

    slots
        .into_iter()
        .filter_map(|slot| slot.into_inner().unwrap())
        .collect()
}

/// The training orchestrator: owns Φ and N matrices, dictionaries,
/// batches, regularizers, scores, the theta cache and the worker pool.
pub struct MasterModel {
    config: ThreadSafeHolder<MasterModelConfig>,
    matrices: Mutex<AHashMap<String, Arc<PhiMatrix>>>,
    dictionaries: Mutex<Arc<AHashMap<String, Arc<Dictionary>>>>,
    batches: Mutex<AHashMap<String, Arc<Batch>>>,
    scores: ThreadSafeHolder<ScoreManager>,
    theta_cache: Mutex<ThetaCache>,
    pool: ThreadPool,
    operations: Mutex<AHashMap<u64, Arc<TaskAwaiter>>>,
    next_operation: AtomicU64,
}

impl MasterModel {
    pub fn new(config: MasterModelConfig) -> Result<Self> {
        config.validate()?;

        let threads = if config.num_processors <= 0 {
            num_cpus::get()
        } else {
            config.num_processors as usize
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("artm-worker-{}", i))
            .build()
            .map_err(|e| Error::Internal(format!("unable to build the worker pool: {}", e)))?;

        let scores = ScoreManager::new(config.scores.clone())?;
        let theta_cache = ThetaCache::new(config.disk_cache_path.clone());

        tracing::info!(
            topics = config.topic_names.len(),
            num_processors = threads,
            "created master model"
        );

        Ok(Self {
            config: ThreadSafeHolder::new(config),
            matrices: Mutex::new(AHashMap::new()),
            dictionaries: Mutex::new(Arc::new(AHashMap::new())),
            batches: Mutex::new(AHashMap::new()),
            scores: ThreadSafeHolder::new(scores),
            theta_cache: Mutex::new(theta_cache),
            pool,
            operations: Mutex::new(AHashMap::new()),
            next_operation: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> Arc<MasterModelConfig> {
        self.config.get()
    }

    pub fn num_processors(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Replaces the configuration. The topic axis must stay unchanged;
    /// use [`MasterModel::reconfigure_topic_names`] for that.
    pub fn reconfigure(&self, config: MasterModelConfig) -> Result<()> {
        config.validate()?;

        if config.topic_names != self.config.get().topic_names {
            return Err(Error::InvalidOperation(
                "reconfigure cannot change the topic axis".to_string(),
            ));
        }

        self.scores.set(ScoreManager::new(config.scores.clone())?);
        self.config.set(config);

        Ok(())
    }

    /// Changes the topic axis, reshaping every stored matrix to the new
    /// list of names. Rejected while any attachment is live.
    pub fn reconfigure_topic_names(&self, topic_names: Vec<String>) -> Result<()> {
        let mut matrices = self.matrices.lock().unwrap();

        for matrix in matrices.values() {
            if let Some(dense) = matrix.as_dense() {
                if dense.attachment_live() {
                    return Err(Error::InvalidOperation(format!(
                        "cannot reconfigure topics while model {} is attached",
                        matrix.name()
                    )));
                }
            }
        }

        let reshaped: Vec<(String, Arc<PhiMatrix>)> = matrices
            .iter()
            .map(|(name, matrix)| {
                let dense = matrix.clone_as_dense().reshape_topics(&topic_names);
                (name.clone(), Arc::new(PhiMatrix::from(dense)))
            })
            .collect();

        for (name, matrix) in reshaped {
            matrices.insert(name, matrix);
        }

        let mut config = (*self.config.get()).clone();
        config.topic_names = topic_names;
        config.validate()?;
        self.config.set(config);

        Ok(())
    }

    // ── Dictionaries ──────────────────────────────────────────────────

    pub fn create_dictionary(&self, data: &DictionaryData) -> Result<()> {
        let dictionary = Dictionary::from_data(data)?;
        let mut table = self.dictionaries.lock().unwrap();

        if table.contains_key(dictionary.name()) {
            return Err(Error::AlreadyExists(format!(
                "dictionary {}",
                dictionary.name()
            )));
        }

        let mut next = (**table).clone();
        next.insert(dictionary.name().to_string(), Arc::new(dictionary));
        *table = Arc::new(next);

        Ok(())
    }

    pub fn get_dictionary(&self, name: &str) -> Result<DictionaryData> {
        Ok(self.dictionary(name)?.to_data())
    }

    pub fn gather_dictionary(&self, target_name: &str, batch_names: &[String]) -> Result<()> {
        let batches = self.resolve_batches(batch_names)?;
        let refs: Vec<&Batch> = batches.iter().map(|b| b.as_ref()).collect();
        let dictionary = Dictionary::gather(target_name, &refs)?;

        self.replace_dictionary(dictionary);

        Ok(())
    }

    pub fn filter_dictionary(
        &self,
        source_name: &str,
        target_name: &str,
        spec: &FilterSpec,
    ) -> Result<()> {
        let filtered = self.dictionary(source_name)?.filter(target_name, spec)?;
        self.replace_dictionary(filtered);

        Ok(())
    }

    pub fn import_dictionary(&self, name: &str, path: &Path) -> Result<()> {
        let dictionary = Dictionary::import(name, path)?;
        self.replace_dictionary(dictionary);

        Ok(())
    }

    pub fn export_dictionary(&self, name: &str, path: &Path) -> Result<()> {
        self.dictionary(name)?.export(path)
    }

    pub fn dispose_dictionary(&self, name: &str) -> Result<()> {
        let mut table = self.dictionaries.lock().unwrap();

        if !table.contains_key(name) {
            return Err(Error::NotFound(format!("dictionary {}", name)));
        }

        let mut next = (**table).clone();
        next.remove(name);
        *table = Arc::new(next);

        Ok(())
    }

    fn dictionary(&self, name: &str) -> Result<Arc<Dictionary>> {
        self.dictionaries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("dictionary {}", name)))
    }

    /// Publishing a dictionary replaces it atomically: in-flight readers
    /// keep their snapshot.
    fn replace_dictionary(&self, dictionary: Dictionary) {
        let mut table = self.dictionaries.lock().unwrap();
        let mut next = (**table).clone();
        next.insert(dictionary.name().to_string(), Arc::new(dictionary));
        *table = Arc::new(next);
    }

    fn dictionary_snapshot(&self) -> Arc<AHashMap<String, Arc<Dictionary>>> {
        self.dictionaries.lock().unwrap().clone()
    }

    // ── Batches ───────────────────────────────────────────────────────

    pub fn import_batches(&self, batches: Vec<Batch>) -> Result<()> {
        for batch in &batches {
            batch.validate()?;
        }

        let mut table = self.batches.lock().unwrap();
        for batch in batches {
            table.insert(batch.id.clone(), Arc::new(batch));
        }

        Ok(())
    }

    pub fn dispose_batch(&self, batch_id: &str) -> Result<()> {
        self.batches
            .lock()
            .unwrap()
            .remove(batch_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))
    }

    /// Batch names resolve against the in-memory store first, then as
    /// filesystem paths.
    fn resolve_batches(&self, batch_names: &[String]) -> Result<Vec<Arc<Batch>>> {
        let table = self.batches.lock().unwrap();

        batch_names
            .iter()
            .map(|name| {
                if let Some(batch) = table.get(name) {
                    return Ok(batch.clone());
                }

                let path = Path::new(name);
                if path.exists() {
                    return Batch::load(path).map(Arc::new);
                }

                Err(Error::NotFound(format!("batch {}", name)))
            })
            .collect()
    }

    // ── Models ────────────────────────────────────────────────────────

    /// Allocates Φ over the dictionary's tokens (restricted to the
    /// configured modalities) and seeds every row from a deterministic
    /// hash of (token, seed), then normalizes columns per modality.
    pub fn initialize_model(&self, args: &InitializeModelArgs) -> Result<()> {
        let config = self.config.get();
        let dictionary = self.dictionary(&args.dictionary_name)?;

        if config.topic_names.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot initialize a model with an empty topic list".to_string(),
            ));
        }

        let tokens: crate::collections::TokenCollection = dictionary
            .tokens()
            .iter()
            .filter(|token| {
                config.class_ids.is_empty() || config.class_ids.contains(&token.class_id)
            })
            .cloned()
            .collect();

        if tokens.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "dictionary {} has no token in the configured modalities",
                args.dictionary_name
            )));
        }

        let name = args.model_name.as_deref().unwrap_or(&config.pwt_name);
        let topics = config.topic_names.len();
        let mut matrix = DensePhiMatrix::new(name, config.topic_names.clone(), tokens);

        for w in 0..matrix.token_size() {
            let token = matrix.tokens().get(w).unwrap().clone();
            let mut rng = ChaCha8Rng::seed_from_u64(token.init_seed(args.seed));

            let mut row: Vec<f32> = (0..topics).map(|_| rng.random::<f32>()).collect();
            let sum = crate::blas::ssum(&row);
            if sum > 0.0 {
                crate::blas::sscale(1.0 / sum, &mut row);
            }

            for (t, &value) in row.iter().enumerate() {
                matrix.set(w, t, value);
            }
        }

        let normalized = phi::normalize(name, &matrix, None)?;
        self.publish(normalized);

        tracing::info!(model = name, "initialized model");

        Ok(())
    }

    /// Replaces (or creates) a model from the message, adopting the token
    /// and topic axes it carries.
    pub fn overwrite_model(&self, model: &TopicModel) -> Result<()> {
        let config = self.config.get();
        let mut matrix = phi::from_topic_model(model)?;

        if matrix.name().is_empty() {
            matrix.set_name(&config.pwt_name);
        }

        self.publish(matrix);

        Ok(())
    }

    pub fn export_model(&self, name: &str, path: &Path) -> Result<()> {
        let model = self.get_topic_model(&GetTopicModelArgs {
            model_name: Some(name.to_string()),
            ..GetTopicModelArgs::default()
        })?;

        model.save(path)
    }

    pub fn import_model(&self, path: &Path) -> Result<()> {
        let model = TopicModel::load(path)?;
        self.overwrite_model(&model)
    }

    pub fn dispose_model(&self, name: &str) -> Result<()> {
        self.matrices
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("model {}", name)))
    }

    /// Removes the named regularizer from the configuration; later passes
    /// run without it.
    pub fn dispose_regularizer(&self, name: &str) -> Result<()> {
        let mut config = (*self.config.get()).clone();
        let before = config.regularizers.len();

        config.regularizers.retain(|r| r.name != name);

        if config.regularizers.len() == before {
            return Err(Error::NotFound(format!("regularizer {}", name)));
        }

        self.config.set(config);

        Ok(())
    }

    /// Pointwise weighted sum of the sources over the union of their
    /// tokens, restricted to the given topic axis and dictionary.
    pub fn merge_model(&self, args: &MergeModelArgs) -> Result<()> {
        if args.sources.is_empty() {
            return Err(Error::InvalidArgument(
                "merge requires at least one source model".to_string(),
            ));
        }

        let sources: Vec<(Arc<PhiMatrix>, f32)> = args
            .sources
            .iter()
            .map(|(name, weight)| self.matrix(name).map(|m| (m, *weight)))
            .collect::<Result<_>>()?;

        let topic_names: Vec<String> = match &args.topic_names {
            Some(names) => names.clone(),
            None => sources[0].0.topic_names().to_vec(),
        };

        let dictionary = match &args.dictionary_name {
            None => None,
            Some(name) => Some(self.dictionary(name)?),
        };

        // Union of tokens in first-appearance order.
        let mut tokens = crate::collections::TokenCollection::new();
        for (source, _) in &sources {
            for token in source.tokens().iter() {
                if dictionary
                    .as_ref()
                    .is_none_or(|d| d.index_of(token).is_some())
                {
                    tokens.intern(token);
                }
            }
        }

        let mut target = DensePhiMatrix::new(&args.target, topic_names.clone(), tokens);

        for (source, weight) in &sources {
            let reshaped = source.clone_as_dense().reshape_topics(&topic_names);
            let values = reshaped.values();
            let topics = topic_names.len();

            for (w, token) in reshaped.tokens().iter().enumerate() {
                let Some(target_row) = target.tokens().index_of(token) else {
                    continue;
                };

                for t in 0..topics {
                    let value = values[w * topics + t];
                    if value != 0.0 {
                        target.increase(target_row, t, weight * value);
                    }
                }
            }
        }

        self.publish(target);

        Ok(())
    }

    /// Applies the configured Phi regularizers to a named n_wt, storing
    /// the result as an r_wt matrix.
    pub fn regularize_model(
        &self,
        pwt_source: &str,
        nwt_source: &str,
        rwt_target: &str,
    ) -> Result<()> {
        let config = self.config.get();
        let nwt = self.matrix(nwt_source)?;
        let pwt = self.matrix(pwt_source)?;

        let dictionaries = self.dictionary_snapshot();
        let resolver = move |name: &str| dictionaries.get(name).cloned();

        let nwt_dense = nwt
            .as_dense()
            .ok_or_else(|| Error::InvalidOperation("regularize requires a dense n_wt".to_string()))?;
        let pwt_dense = pwt
            .as_dense()
            .ok_or_else(|| Error::InvalidOperation("regularize requires a dense Φ".to_string()))?;

        let mut rwt = match regularize_phi(&config.regularizers, nwt_dense, pwt_dense, &resolver)? {
            Some(rwt) => rwt,
            None => DensePhiMatrix::new(
                rwt_target,
                nwt_dense.topic_names().to_vec(),
                nwt_dense.tokens().clone(),
            ),
        };
        rwt.set_name(rwt_target);

        self.publish(rwt);

        Ok(())
    }

    /// Normalizes a named n_wt (+ optional r_wt) into a column-stochastic
    /// Φ stored under `pwt_target`.
    pub fn normalize_model(
        &self,
        pwt_target: &str,
        nwt_source: &str,
        rwt_source: Option<&str>,
    ) -> Result<()> {
        let nwt = self.matrix(nwt_source)?;
        let rwt = match rwt_source {
            None => None,
            Some(name) => Some(self.matrix(name)?),
        };

        let nwt_dense = nwt
            .as_dense()
            .ok_or_else(|| Error::InvalidOperation("normalize requires a dense n_wt".to_string()))?;
        let rwt_dense = rwt.as_ref().and_then(|r| r.as_dense());

        let normalized = phi::normalize(pwt_target, nwt_dense, rwt_dense)?;
        self.publish(normalized);

        Ok(())
    }

    /// Attaches the named model to a shared buffer and returns the
    /// handle. While the handle lives, the topic axis is frozen.
    pub fn attach_model(&self, name: &str) -> Result<PhiAttachment> {
        let mut matrices = self.matrices.lock().unwrap();

        let matrix = matrices
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("model {}", name)))?;

        let mut dense = matrix
            .as_dense()
            .ok_or_else(|| Error::InvalidOperation("only dense models can be attached".to_string()))?
            .clone();

        let buffer = dense.attach();
        let token_size = dense.token_size();
        let topic_size = dense.topic_size();

        matrices.insert(name.to_string(), Arc::new(PhiMatrix::from(dense)));

        Ok(PhiAttachment {
            buffer,
            token_size,
            topic_size,
        })
    }

    pub fn get_topic_model(&self, args: &GetTopicModelArgs) -> Result<TopicModel> {
        let config = self.config.get();
        let name = args.model_name.as_deref().unwrap_or(&config.pwt_name);
        let matrix = self.matrix(name)?;
        let eps = args.eps.unwrap_or(DEFAULT_EPS);

        let selected_topics: Vec<usize> = match &args.topic_names {
            None => (0..matrix.topic_size()).collect(),
            Some(subset) => subset
                .iter()
                .map(|topic| {
                    matrix
                        .topic_names()
                        .iter()
                        .position(|t| t == topic)
                        .ok_or_else(|| Error::NotFound(format!("topic {}", topic)))
                })
                .collect::<Result<_>>()?,
        };

        let mut model = TopicModel {
            name: name.to_string(),
            topic_name: selected_topics
                .iter()
                .map(|&t| matrix.topic_names()[t].clone())
                .collect(),
            ..TopicModel::default()
        };

        for (w, token) in matrix.tokens().iter().enumerate() {
            if let Some(class_ids) = &args.class_ids {
                if !class_ids.contains(&token.class_id) {
                    continue;
                }
            }

            if let Some(keywords) = &args.keywords {
                if !keywords.contains(&token.keyword) {
                    continue;
                }
            }

            model.token.push(token.keyword.clone());
            model.class_id.push(token.class_id.clone());
            model
                .transaction_typename
                .push(token.transaction_typename.clone());

            match args.layout {
                MatrixLayout::Dense => {
                    model
                        .token_weights
                        .push(selected_topics.iter().map(|&t| matrix.get(w, t)).collect());
                }
                MatrixLayout::Sparse => {
                    let mut weights = Vec::new();
                    let mut indices = Vec::new();

                    for (position, &t) in selected_topics.iter().enumerate() {
                        let value = matrix.get(w, t);
                        if value.abs() >= eps {
                            indices.push(position as u32);
                            weights.push(value);
                        }
                    }

                    model.token_weights.push(weights);
                    model.topic_indices.push(indices);
                }
            }
        }

        Ok(model)
    }

    // ── Fitting ───────────────────────────────────────────────────────

    /// Full collection passes: each pass re-accumulates N from every
    /// batch against the current Φ snapshot, then regularizes, normalizes
    /// and commits the next Φ.
    pub fn fit_offline(&self, batch_names: &[String], num_collection_passes: usize) -> Result<()> {
        let batches = self.resolve_batches(batch_names)?;

        for pass in 0..num_collection_passes {
            let phi = self.matrix(&self.config.get().pwt_name)?;
            let context = self.pass_context(phi, batches.clone(), true)?;
            let output = self.pool.install(|| execute_pass(&context));

            self.commit(&context, output, 0.0, 1.0)?;

            tracing::debug!(pass, batches = batches.len(), "finished offline pass");
        }

        Ok(())
    }

    /// Mini-batch fitting with exponential forgetting: at every
    /// checkpoint the accumulated N folds into Φ as
    /// `decay · Φ_old + apply · normalize(N + R)`.
    ///
    /// With `asynchronous`, the next interval is processed against the
    /// pre-checkpoint Φ while the commit is in flight.
    pub fn fit_online(&self, args: &FitOnlineArgs) -> Result<()> {
        let batches = self.resolve_batches(&args.batch_names)?;

        if args.update_after.is_empty() {
            return Err(Error::InvalidArgument(
                "fit_online requires at least one checkpoint".to_string(),
            ));
        }

        if args.update_after.len() != args.apply_weight.len()
            || args.update_after.len() != args.decay_weight.len()
        {
            return Err(Error::InvalidArgument(format!(
                "update_after ({}), apply_weight ({}) and decay_weight ({}) sizes disagree",
                args.update_after.len(),
                args.apply_weight.len(),
                args.decay_weight.len()
            )));
        }

        let mut previous = 0usize;
        for &checkpoint in &args.update_after {
            if checkpoint <= previous {
                return Err(Error::InvalidArgument(
                    "update_after must be strictly increasing".to_string(),
                ));
            }
            previous = checkpoint;
        }

        if *args.update_after.last().unwrap() > batches.len() {
            return Err(Error::InvalidArgument(format!(
                "update_after reaches {} but only {} batches were given",
                args.update_after.last().unwrap(),
                batches.len()
            )));
        }

        type Pending = (Arc<PassContext>, Arc<BlockingQueue<PassOutput>>, f32, f32);
        let mut pending: Option<Pending> = None;
        let mut processed = 0usize;

        for (k, &checkpoint) in args.update_after.iter().enumerate() {
            let interval = batches[processed..checkpoint].to_vec();
            processed = checkpoint;

            let phi = self.matrix(&self.config.get().pwt_name)?;
            let context = Arc::new(self.pass_context(phi, interval, true)?);
            let decay = args.decay_weight[k];
            let apply = args.apply_weight[k];

            if args.asynchronous {
                let queue = Arc::new(BlockingQueue::new());

                {
                    let context = context.clone();
                    let queue = queue.clone();

                    self.pool.spawn(move || {
                        let output = execute_pass(&context);
                        queue.push(output);
                        queue.close();
                    });
                }

                if let Some((prev_context, prev_queue, prev_decay, prev_apply)) = pending.take() {
                    let output = prev_queue.pop().unwrap_or_default();
                    self.commit(&prev_context, output, prev_decay, prev_apply)?;
                }

                pending = Some((context, queue, decay, apply));
            } else {
                let output = self.pool.install(|| execute_pass(&context));
                self.commit(&context, output, decay, apply)?;
            }
        }

        if let Some((context, queue, decay, apply)) = pending {
            let output = queue.pop().unwrap_or_default();
            self.commit(&context, output, decay, apply)?;
        }

        Ok(())
    }

    /// One E-step over the batches without touching Φ; returns the
    /// resulting Θ.
    pub fn transform(&self, batch_names: &[String], args: &GetThetaMatrixArgs) -> Result<ThetaMatrix> {
        let config = self.config.get();
        let batches = self.resolve_batches(batch_names)?;

        let phi = self.matrix(&config.pwt_name)?;
        let context = self.pass_context(phi, batches, false)?;
        let output = self.pool.install(|| execute_pass(&context));

        let mut theta = ThetaMatrix::new(config.topic_names.clone());

        for (contribution, _) in &output {
            for (position, &item_id) in contribution.theta.item_ids.iter().enumerate() {
                theta.push(
                    item_id,
                    &contribution.theta.item_titles[position],
                    contribution.theta.item_weights[position].clone(),
                );
            }
        }

        if config.cache_theta {
            let mut cache = self.theta_cache.lock().unwrap();
            for (contribution, _) in output {
                cache.store(&contribution.batch_id.clone(), contribution.theta)?;
            }
        }

        theta.project(
            args.topic_names.as_deref(),
            args.layout == MatrixLayout::Sparse,
            args.eps.unwrap_or(DEFAULT_EPS),
        )
    }

    /// E-step against an explicit Φ source, accumulating into a named
    /// n_wt. The core of the async operation API.
    pub fn process_batches(&self, args: &ProcessBatchesArgs) -> Result<ThetaMatrix> {
        let config = self.config.get();
        let batches = self.resolve_batches(&args.batch_names)?;

        let phi = self.matrix(&args.pwt_source)?;
        let context = self.pass_context(phi, batches, true)?;

        let output = self.pool.install(|| execute_pass(&context));

        if let Some(nwt_target) = &args.nwt_target {
            let phi_dense = context
                .phi
                .as_dense()
                .ok_or_else(|| Error::Internal("pwt source is not dense".to_string()))?;

            let mut nwt = DensePhiMatrix::new(
                nwt_target,
                phi_dense.topic_names().to_vec(),
                phi_dense.tokens().clone(),
            );

            for (contribution, _) in &output {
                for (&row, values) in &contribution.nwt {
                    nwt.increase_row(row, values);
                }
            }

            self.publish(nwt);
        }

        let mut theta = ThetaMatrix::new(config.topic_names.clone());
        for (contribution, _) in &output {
            for (position, &item_id) in contribution.theta.item_ids.iter().enumerate() {
                theta.push(
                    item_id,
                    &contribution.theta.item_titles[position],
                    contribution.theta.item_weights[position].clone(),
                );
            }
        }

        Ok(theta)
    }

    /// Submits [`MasterModel::process_batches`] to the pool and returns
    /// an operation id to poll with [`MasterModel::await_operation`].
    /// Takes the shared handle so the running operation keeps the master
    /// alive.
    pub fn async_process_batches(self: Arc<Self>, args: ProcessBatchesArgs) -> Result<u64> {
        // Fail fast on unresolvable inputs before going asynchronous.
        self.matrix(&args.pwt_source)?;
        self.resolve_batches(&args.batch_names)?;

        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let awaiter = TaskAwaiter::new();

        self.operations.lock().unwrap().insert(id, awaiter.clone());

        let master = self.clone();
        self.pool.spawn(move || {
            let result = master.process_batches(&args).map(|_| ());
            awaiter.complete(result);
        });

        Ok(id)
    }

    /// Returns true when the operation finished, false when it is still
    /// working after the timeout. A failed operation surfaces its error.
    pub fn await_operation(&self, id: u64, timeout: Option<Duration>) -> Result<bool> {
        let awaiter = self
            .operations
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operation {}", id)))?;

        match awaiter.wait(timeout) {
            None => Ok(false),
            Some(Ok(())) => Ok(true),
            Some(Err(error)) => Err(error),
        }
    }

    // ── Requests ──────────────────────────────────────────────────────

    pub fn get_theta_matrix(&self, args: &GetThetaMatrixArgs) -> Result<ThetaMatrix> {
        let config = self.config.get();

        if !config.cache_theta {
            return Err(Error::InvalidOperation(
                "theta caching is disabled; enable cache_theta or use transform".to_string(),
            ));
        }

        let cache = self.theta_cache.lock().unwrap();
        let mut theta = ThetaMatrix::new(config.topic_names.clone());

        for batch_id in cache.batch_ids() {
            let Some(cached) = cache.get(&batch_id)? else {
                continue;
            };

            if cached.topic_names != theta.topic_names {
                continue;
            }

            for (position, &item_id) in cached.item_ids.iter().enumerate() {
                theta.push(
                    item_id,
                    &cached.item_titles[position],
                    cached.item_weights[position].clone(),
                );
            }
        }

        theta.project(
            args.topic_names.as_deref(),
            args.layout == MatrixLayout::Sparse,
            args.eps.unwrap_or(DEFAULT_EPS),
        )
    }

    pub fn get_score(&self, name: &str) -> Result<ScoreValue> {
        self.scores.get().get(name)
    }

    pub fn get_score_array(&self, name: &str) -> Result<Vec<ScoreValue>> {
        self.scores.get().get_array(name)
    }

    pub fn clear_score_cache(&self) {
        self.scores.get().clear_cache();
    }

    pub fn clear_score_array_cache(&self) {
        self.scores.get().clear_array_cache();
    }

    pub fn clear_theta_cache(&self) {
        self.theta_cache.lock().unwrap().clear();
    }

    pub fn get_master_info(&self) -> MasterComponentInfo {
        let config = self.config.get();

        let mut matrices: Vec<(String, usize, usize)> = self
            .matrices
            .lock()
            .unwrap()
            .values()
            .map(|m| (m.name().to_string(), m.token_size(), m.topic_size()))
            .collect();
        matrices.sort();

        let mut dictionaries: Vec<(String, usize)> = self
            .dictionaries
            .lock()
            .unwrap()
            .values()
            .map(|d| (d.name().to_string(), d.len()))
            .collect();
        dictionaries.sort();

        MasterComponentInfo {
            num_processors: self.num_processors(),
            matrices,
            dictionaries,
            batches: self.batches.lock().unwrap().len(),
            score_names: config.scores.iter().map(|s| s.name.clone()).collect(),
            regularizer_names: config.regularizers.iter().map(|r| r.name.clone()).collect(),
            cached_theta_batches: self.theta_cache.lock().unwrap().len(),
        }
    }

    /// Deep copy: an independent master with the same config, matrices,
    /// dictionaries, batches, caches and score state.
    pub fn duplicate(&self) -> Result<MasterModel> {
        let config = (*self.config.get()).clone();
        let clone = MasterModel::new(config)?;

        {
            let source = self.matrices.lock().unwrap();
            let mut target = clone.matrices.lock().unwrap();

            for (name, matrix) in source.iter() {
                let detached = match matrix.as_ref() {
                    PhiMatrix::Dense(dense) => PhiMatrix::from(dense.detach_clone()),
                    PhiMatrix::Sparse(sparse) => PhiMatrix::from(sparse.clone()),
                };
                target.insert(name.clone(), Arc::new(detached));
            }
        }

        *clone.dictionaries.lock().unwrap() = self.dictionary_snapshot();
        *clone.batches.lock().unwrap() = self.batches.lock().unwrap().clone();
        clone.scores.set(self.scores.get().duplicate());

        {
            let source = self.theta_cache.lock().unwrap();
            let mut target = clone.theta_cache.lock().unwrap();

            for batch_id in source.batch_ids() {
                if let Some(cached) = source.get(&batch_id)? {
                    target.store(&batch_id, (*cached).clone())?;
                }
            }
        }

        Ok(clone)
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn matrix(&self, name: &str) -> Result<Arc<PhiMatrix>> {
        self.matrices
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model {}", name)))
    }

    fn publish(&self, matrix: DensePhiMatrix) {
        self.matrices
            .lock()
            .unwrap()
            .insert(matrix.name().to_string(), Arc::new(PhiMatrix::from(matrix)));
    }

    fn processor_settings(&self, config: &MasterModelConfig) -> ProcessorSettings {
        let class_weights = if config.class_ids.is_empty() {
            None
        } else {
            Some(
                config
                    .class_ids
                    .iter()
                    .enumerate()
                    .map(|(i, class_id)| {
                        (
                            class_id.clone(),
                            config.class_weights.get(i).copied().unwrap_or(1.0),
                        )
                    })
                    .collect(),
            )
        };

        let typename_weights = if config.transaction_typenames.is_empty() {
            None
        } else {
            Some(
                config
                    .transaction_typenames
                    .iter()
                    .enumerate()
                    .map(|(i, typename)| {
                        (
                            typename.clone(),
                            config.transaction_weights.get(i).copied().unwrap_or(1.0),
                        )
                    })
                    .collect(),
            )
        };

        ProcessorSettings {
            topic_names: config.topic_names.clone(),
            class_weights,
            typename_weights,
            num_document_passes: config.num_document_passes,
            opt_for_avx: config.opt_for_avx,
            reuse_theta: config.reuse_theta,
        }
    }

    fn pass_context(
        &self,
        phi: Arc<PhiMatrix>,
        batches: Vec<Arc<Batch>>,
        accumulate_nwt: bool,
    ) -> Result<PassContext> {
        let config = self.config.get();
        let settings = Arc::new(self.processor_settings(&config));
        let regularizers = Arc::new(ThetaRegularizers::resolve(
            &config.regularizers,
            &config.topic_names,
        )?);

        let ptd = match &config.ptd_name {
            None => None,
            Some(name) => self.matrix(name).ok(),
        };

        let cached_theta = if config.reuse_theta {
            let cache = self.theta_cache.lock().unwrap();
            batches
                .iter()
                .map(|batch| cache.get(&batch.id))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![None; batches.len()]
        };

        Ok(PassContext {
            phi,
            batches,
            settings,
            regularizers,
            ptd,
            cached_theta,
            score_configs: config.scores.clone(),
            dictionaries: self.dictionary_snapshot(),
            accumulate_nwt,
        })
    }

    /// Reduces a pass output into N, runs the regularize/normalize
    /// pipeline and commits `decay · Φ_old + apply · normalize(N + R)` as
    /// the next Φ, then finalizes the pass scores against it.
    fn commit(
        &self,
        context: &PassContext,
        output: PassOutput,
        decay_weight: f32,
        apply_weight: f32,
    ) -> Result<()> {
        let config = self.config.get();

        let phi_dense = context
            .phi
            .as_dense()
            .ok_or_else(|| Error::Internal("committed Φ is not dense".to_string()))?;

        let mut nwt = DensePhiMatrix::new(
            &config.nwt_name,
            phi_dense.topic_names().to_vec(),
            phi_dense.tokens().clone(),
        );

        // Deterministic reduction: contributions arrive in submission
        // order and every (w, t) cell is touched once per batch.
        for (contribution, _) in &output {
            for (&row, values) in &contribution.nwt {
                nwt.increase_row(row, values);
            }
        }

        let dictionaries = context.dictionaries.clone();
        let resolver = move |name: &str| dictionaries.get(name).cloned();

        let rwt = regularize_phi(&config.regularizers, &nwt, phi_dense, &resolver)?;
        let candidate = phi::normalize(&config.pwt_name, &nwt, rwt.as_ref())?;

        let committed = if decay_weight == 0.0 && apply_weight == 1.0 {
            candidate
        } else {
            // The decay term reads the currently published Φ, which in
            // async fitting is ahead of the processing snapshot.
            let published = self.matrix(&config.pwt_name)?;
            let published_dense = published
                .as_dense()
                .ok_or_else(|| Error::Internal("published Φ is not dense".to_string()))?;

            let mut blended = DensePhiMatrix::new(
                &config.pwt_name,
                phi_dense.topic_names().to_vec(),
                phi_dense.tokens().clone(),
            );

            let old_values = published_dense.values();
            let new_values = candidate.values();
            let topics = blended.topic_size();

            for w in 0..blended.token_size() {
                for t in 0..topics {
                    let offset = w * topics + t;
                    blended.set(
                        w,
                        t,
                        decay_weight * old_values[offset] + apply_weight * new_values[offset],
                    );
                }
            }

            blended
        };

        self.publish(nwt);
        self.publish(committed);

        // Scores read the just-committed Φ.
        let committed = self.matrix(&config.pwt_name)?;
        let scores = self.scores.get();

        for (_, partials) in &output {
            scores.append(partials.clone());
        }

        let dictionaries = context.dictionaries.clone();
        let resolver = move |name: &str| dictionaries.get(name).cloned();
        scores.finalize_pass(&committed, &resolver);

        if config.cache_theta {
            let mut cache = self.theta_cache.lock().unwrap();
            for (contribution, _) in output {
                cache.store(&contribution.batch_id.clone(), contribution.theta)?;
            }
        }

        Ok(())
    }
}
