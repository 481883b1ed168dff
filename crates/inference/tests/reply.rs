use inference::{load_model, newest_checkpoint, Overrides, Responder};
use seq2seq_core::{ModelConfig, Seq2SeqModel, Session, VocabularyInfo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::{nn, Device};

const VOCAB: i64 = 30;

fn config() -> ModelConfig {
    ModelConfig {
        hidden_size: 12,
        num_layers: 2,
        embedding_size: 6,
        max_length_enco: 4,
        max_length_deco: 6,
        ..Default::default()
    }
}

fn checkpoint_dir(name: &str, config: &ModelConfig) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("inference-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), serde_json::to_string(config).unwrap()).unwrap();
    VocabularyInfo::new(VOCAB).save(dir.join("vocab.json")).unwrap();
    dir
}

fn save_training_checkpoint(dir: &Path, config: &ModelConfig, step: usize) {
    let vs = nn::VarStore::new(Device::Cpu);
    let model = Seq2SeqModel::new(&vs.root(), config.clone(), VocabularyInfo::new(VOCAB)).unwrap();
    let session = Session::new(Arc::new(model), vs).unwrap();
    session
        .save(dir.join(format!("checkpoint_{}.safetensors", step)))
        .unwrap();
}

#[test]
fn greedy_replies_fit_the_decoder() {
    let dir = checkpoint_dir("greedy", &config());
    let session = load_model(&dir, Device::Cpu, &Overrides::default()).unwrap();
    assert!(session.model().config().test);

    let mut responder = Responder::new(session);
    let reply = responder.reply(&[5, 6, 7], None).unwrap();
    assert!(reply.len() <= 6);
    assert!(!reply.contains(&VocabularyInfo::new(VOCAB).eos));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn beam_search_can_be_forced() {
    let config = ModelConfig {
        attention: true,
        ..config()
    };
    let dir = checkpoint_dir("beam", &config);
    let overrides = Overrides {
        beam_search: Some(true),
        beam_size: Some(4),
    };
    let session = load_model(&dir, Device::Cpu, &overrides).unwrap();
    assert!(session.model().config().beam_search);

    let mut responder = Responder::new(session);
    let reply = responder.reply(&[8, 9], None).unwrap();
    assert!(reply.len() <= 6);
    assert!(reply.iter().all(|&tok| (0..VOCAB).contains(&tok)));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn empty_input_gets_an_empty_reply() {
    let dir = checkpoint_dir("empty", &config());
    let mut responder = Responder::new(load_model(&dir, Device::Cpu, &Overrides::default()).unwrap());
    assert!(responder.reply(&[], None).unwrap().is_empty());
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn newest_checkpoint_compares_step_numbers() {
    let config = config();
    let dir = checkpoint_dir("newest", &config);
    save_training_checkpoint(&dir, &config, 5);
    save_training_checkpoint(&dir, &config, 12);

    let newest = newest_checkpoint(&dir).unwrap().unwrap();
    assert!(newest.ends_with("checkpoint_12.safetensors"));

    // Weights saved from a training graph load into the inference graph.
    let session = load_model(&dir, Device::Cpu, &Overrides::default()).unwrap();
    let mut responder = Responder::new(session);
    assert!(responder.reply(&[4, 5], None).is_ok());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn missing_config_is_an_error() {
    let dir = std::env::temp_dir().join(format!("inference-missing-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    assert!(load_model(&dir, Device::Cpu, &Overrides::default()).is_err());
    std::fs::remove_dir_all(&dir).unwrap();
}
