//! End-to-end run: load, wrap, inject, train, evaluate.

use std::io::Write;

use candle_core::Device;
use tracing::{debug, info};

use crate::classifier::PromptForClassification;
use crate::config::{select_device, PipelineConfig};
use crate::data::loader::PromptDataLoader;
use crate::data::superglue::{load_dataset, DatasetSplits, Split};
use crate::error::{PromptError, Result};
use crate::io::save_pretrained;
use crate::model::DeltaModel;
use crate::plm::load_plm;
use crate::plm::t5::T5ForConditionalGeneration;
use crate::plm::tokenizer::{T5TokenizerWrapper, TextEncoder, TokenizedFeature};
use crate::prompts::template::MixedTemplate;
use crate::prompts::verbalizer::ManualVerbalizer;
use crate::training::{evaluate, EvalReport, Trainer};
use crate::traits::{AdapterConfig, ParameterTree};

fn io_err(e: std::io::Error) -> PromptError {
    PromptError::Io(format!("failed to write report: {e}"))
}

/// Wrap and tokenize every example of every split with `wrapper`.
///
/// # Errors
/// Returns the first wrapping or tokenization failure.
pub fn tokenize_splits(
    splits: &DatasetSplits,
    template: &MixedTemplate,
    wrapper: &T5TokenizerWrapper<'_>,
) -> Result<Vec<(Split, Vec<TokenizedFeature>)>> {
    Split::ALL
        .into_iter()
        .map(|split| {
            let features = splits
                .get(split)
                .iter()
                .map(|example| wrapper.tokenize_one_example(&template.wrap_one_example(example)?))
                .collect::<Result<Vec<_>>>()?;
            debug!(?split, count = features.len(), "tokenized split");
            Ok((split, features))
        })
        .collect()
}

/// Load the dataset and backbone named by `config`, then [`run_with`] them,
/// printing to stdout.
///
/// # Errors
/// Returns the first error of any stage; nothing is retried.
pub fn run(config: &PipelineConfig) -> Result<EvalReport> {
    config.validate()?;
    let device = select_device(&config.device)?;
    info!(device = %config.device, "selected device");

    let splits = load_dataset(&config.dataset)?;
    let plm = load_plm(&config.plm, &device)?;
    let mut stdout = std::io::stdout().lock();
    run_with(config, plm.model, &plm.tokenizer, &splits, &device, &mut stdout)
}

/// Run the pipeline on an already loaded backbone and dataset.
///
/// Writes the first training example, its wrapped and tokenized forms, the
/// label-word ids, the parameter names and finally the accuracy to `out`.
///
/// # Errors
/// Returns the first error of any stage; nothing is retried.
pub fn run_with(
    config: &PipelineConfig,
    mut model: T5ForConditionalGeneration,
    tokenizer: &dyn TextEncoder,
    splits: &DatasetSplits,
    device: &Device,
    out: &mut dyn Write,
) -> Result<EvalReport> {
    let first = splits
        .train
        .first()
        .ok_or_else(|| PromptError::Dataset("training split is empty".into()))?;
    writeln!(out, "{first}").map_err(io_err)?;

    let template = MixedTemplate::new(&config.template.text, tokenizer, model.shared_embedding())?;
    let wrapped = template.wrap_one_example(first)?;
    writeln!(out, "{wrapped}").map_err(io_err)?;

    let wrapper = T5TokenizerWrapper::new(tokenizer, config.tokenizer.clone())?;
    let feature = wrapper.tokenize_one_example(&wrapped)?;
    writeln!(out, "{feature:?}").map_err(io_err)?;
    writeln!(out, "{:?}", tokenizer.convert_ids_to_tokens(&feature.input_ids)).map_err(io_err)?;
    writeln!(out, "{:?}", tokenizer.convert_ids_to_tokens(&feature.decoder_input_ids))
        .map_err(io_err)?;
    tokenize_splits(splits, &template, &wrapper)?;

    let mut train_loader = PromptDataLoader::new(
        &splits.train,
        &template,
        &wrapper,
        &config.loader,
        config.loader.shuffle_train,
        device,
    )?;
    let mut validation_loader =
        PromptDataLoader::new(&splits.validation, &template, &wrapper, &config.loader, false, device)?;

    let verbalizer = ManualVerbalizer::new(config.verbalizer.clone(), tokenizer, device)?;
    writeln!(out, "{:?}", verbalizer.label_words_ids()).map_err(io_err)?;

    let delta = DeltaModel::inject(&mut model, config.lora.clone())?;
    delta.freeze(&mut model);
    delta.log(&model);

    let classifier = PromptForClassification::new(model, template, verbalizer);
    let parameters = classifier.named_parameters();
    for p in &parameters {
        writeln!(out, "{}", p.name).map_err(io_err)?;
    }

    let mut trainer = Trainer::new(&parameters, config.training.clone())?;
    trainer.train(&classifier, &mut train_loader)?;

    let report = evaluate(&classifier, &mut validation_loader)?;
    writeln!(out, "{}", report.accuracy).map_err(io_err)?;

    if let Some(dir) = &config.output_dir {
        save_pretrained(&classifier, config, dir)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::example::NO_LABEL;
    use crate::io::{ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};
    use crate::prompts::template::DEFAULT_TEMPLATE;
    use crate::test_utils::{sample_examples, sample_vocab, tiny_t5_config};
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};
    use tempfile::TempDir;

    fn tiny_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.device = "cpu".into();
        config.tokenizer.max_seq_length = 32;
        config.loader.max_seq_length = 32;
        config.loader.seed = Some(3);
        config.training.num_epochs = 2;
        config
    }

    fn tiny_model() -> anyhow::Result<T5ForConditionalGeneration> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        Ok(T5ForConditionalGeneration::new(&tiny_t5_config(), vb)?)
    }

    fn splits() -> DatasetSplits {
        DatasetSplits {
            train: sample_examples(),
            validation: sample_examples(),
            test: Vec::new(),
        }
    }

    #[test]
    fn test_run_prints_stages_and_accuracy() -> anyhow::Result<()> {
        let vocab = sample_vocab();
        let mut out = Vec::new();
        let report = run_with(&tiny_config(), tiny_model()?, &vocab, &splits(), &Device::Cpu, &mut out)?;
        assert_eq!(report.predictions.len(), 6);
        assert!((0.0..=1.0).contains(&report.accuracy));

        let printed = String::from_utf8(out)?;
        assert!(printed.contains("\"text_a\": \"it was raining all day\""));
        assert!(printed.contains("<extra_id_0>"));
        assert!(printed.contains("template.soft_embedding.weight"));
        assert!(printed.contains("SelfAttention.q.lora.lora_a.weight"));
        let last = printed.lines().last().unwrap_or_default();
        assert!((last.parse::<f64>()? - report.accuracy).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_every_split_is_tokenized() -> anyhow::Result<()> {
        let vocab = sample_vocab();
        let model = tiny_model()?;
        let template = MixedTemplate::new(DEFAULT_TEMPLATE, &vocab, model.shared_embedding())?;
        let wrapper = T5TokenizerWrapper::new(&vocab, tiny_config().tokenizer)?;
        let mut test = sample_examples();
        for example in &mut test {
            example.label = NO_LABEL;
        }
        let splits = DatasetSplits {
            train: sample_examples(),
            validation: sample_examples()[..2].to_vec(),
            test,
        };

        let tokenized = tokenize_splits(&splits, &template, &wrapper)?;
        let counts: Vec<(Split, usize)> = tokenized.iter().map(|(s, f)| (*s, f.len())).collect();
        assert_eq!(counts, vec![(Split::Train, 6), (Split::Validation, 2), (Split::Test, 6)]);
        let (_, test_features) = &tokenized[2];
        assert!(test_features.iter().all(|f| f.label == NO_LABEL && f.input_ids.len() == 32));
        Ok(())
    }

    #[test]
    fn test_output_dir_receives_weights_and_config() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut config = tiny_config();
        config.training.num_epochs = 1;
        config.output_dir = Some(dir.path().join("run"));

        let vocab = sample_vocab();
        run_with(&config, tiny_model()?, &vocab, &splits(), &Device::Cpu, &mut std::io::sink())?;
        assert!(dir.path().join("run").join(ADAPTER_WEIGHTS_FILENAME).is_file());
        assert!(dir.path().join("run").join(ADAPTER_CONFIG_FILENAME).is_file());
        Ok(())
    }

    #[test]
    fn test_empty_training_split_is_an_error() -> anyhow::Result<()> {
        let vocab = sample_vocab();
        let empty = DatasetSplits::default();
        let result = run_with(&tiny_config(), tiny_model()?, &vocab, &empty, &Device::Cpu, &mut std::io::sink());
        assert!(matches!(result, Err(PromptError::Dataset(_))));
        Ok(())
    }

    #[test]
    fn test_empty_validation_split_is_an_error() -> anyhow::Result<()> {
        let vocab = sample_vocab();
        let mut config = tiny_config();
        config.training.num_epochs = 1;
        let splits = DatasetSplits {
            train: sample_examples(),
            ..Default::default()
        };
        let result = run_with(&config, tiny_model()?, &vocab, &splits, &Device::Cpu, &mut std::io::sink());
        assert!(matches!(result, Err(PromptError::EmptyEvaluation)));
        Ok(())
    }
}
