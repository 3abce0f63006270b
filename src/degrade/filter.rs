//! # 滤镜参数与执行计划
//!
//! ## 设计思路
//!
//! 把“降质强度 → 缩放系数 / 质量 / 滤镜链 / 引擎参数”的推导集中为纯函数，
//! 保证同一输入永远得到同一组参数，便于测试与复现。
//!
//! ## 实现思路
//!
//! - `scale_factor = 1 / amount`
//! - `quality = clamp(40 + (amount - 3) * 5, 40, 50)`
//! - 滤镜链使用探测到的原始尺寸：先缩小到 `floor(w * scale_factor)`，
//!   再放大回原始宽高，最后强制 4:2:0 色度下采样。
//! - 三轮策略的中间结果写成 JPEG，让每一轮都叠加一次有损压缩。

use super::config::DegradationStrategy;
use super::source::ImageDimensions;

/// 基准质量（amount = 3 时）。
const BASE_QUALITY: i64 = 40;
/// 质量上限。
const MAX_QUALITY: i64 = 50;
/// 每增加一级强度，质量参数增加的步长。
const QUALITY_STEP: i64 = 5;

/// 由降质强度推导出的确定性参数。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub amount: u32,
    pub scale_factor: f64,
    pub quality: u32,
}

impl FilterParams {
    pub fn for_amount(amount: u32) -> Self {
        Self {
            amount,
            scale_factor: scale_factor(amount),
            quality: quality_for_amount(amount),
        }
    }

    /// 缩小阶段的目标尺寸（每边至少 1 像素）。
    ///
    /// `floor(side * scale_factor)` 用整数除法计算，避免浮点误差导致少一像素。
    pub fn downscaled(&self, dims: ImageDimensions) -> ImageDimensions {
        let divisor = self.amount.max(1);
        let shrink = |side: u32| (side / divisor).max(1);
        ImageDimensions {
            width: shrink(dims.width),
            height: shrink(dims.height),
        }
    }

    /// 构建滤镜链：缩小 → 放大回原尺寸 → yuv420p。
    pub fn filter_chain(&self, dims: ImageDimensions) -> String {
        let down = self.downscaled(dims);
        format!(
            "scale={}:{}:flags=bilinear,scale={}:{}:flags=bilinear,format=yuv420p",
            down.width, down.height, dims.width, dims.height
        )
    }
}

/// `1 / amount`。
pub fn scale_factor(amount: u32) -> f64 {
    1.0 / amount.max(1) as f64
}

/// `clamp(40 + (amount - 3) * 5, 40, 50)`。
pub fn quality_for_amount(amount: u32) -> u32 {
    let raw = BASE_QUALITY + (amount as i64 - 3) * QUALITY_STEP;
    raw.clamp(BASE_QUALITY, MAX_QUALITY) as u32
}

/// 单次引擎调用。
#[derive(Debug, Clone, PartialEq)]
pub struct PassPlan {
    pub input: String,
    pub output: String,
    pub argv: Vec<String>,
}

/// 一次降质调用的全部虚拟文件名与引擎调用。
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub input_name: String,
    pub output_name: String,
    /// 中间临时文件（仅多轮策略存在）。
    pub intermediates: Vec<String>,
    pub passes: Vec<PassPlan>,
}

impl ExecutionPlan {
    /// 生成执行计划。
    ///
    /// 文件名格式：
    /// - 输入：`{millis}-INPUT-{token}.{ext}`
    /// - 中间：`{millis}-PASS{n}-{token}.jpg`
    /// - 输出：`{millis}-FILE-{token}.png`
    pub fn build(
        strategy: DegradationStrategy,
        params: &FilterParams,
        dims: ImageDimensions,
        timestamp_ms: i64,
        token: &str,
        input_ext: &str,
    ) -> Self {
        let input_name = format!("{}-INPUT-{}.{}", timestamp_ms, token, input_ext);
        let output_name = format!("{}-FILE-{}.png", timestamp_ms, token);
        let pass_count = strategy.passes();

        let intermediates: Vec<String> = (1..pass_count)
            .map(|n| format!("{}-PASS{}-{}.jpg", timestamp_ms, n, token))
            .collect();

        let chain = params.filter_chain(dims);
        let mut stages = Vec::with_capacity(pass_count + 1);
        stages.push(input_name.clone());
        stages.extend(intermediates.iter().cloned());
        stages.push(output_name.clone());

        let passes = stages
            .windows(2)
            .map(|pair| PassPlan {
                input: pair[0].clone(),
                output: pair[1].clone(),
                argv: build_argv(&pair[0], &chain, params.quality, &pair[1]),
            })
            .collect();

        Self {
            input_name,
            output_name,
            intermediates,
            passes,
        }
    }

    /// 输入与中间文件（成功后需要删除的临时文件）。
    pub fn temporaries(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.input_name).chain(self.intermediates.iter())
    }
}

/// `-i <input> -vf <chain> -q:v <quality> <output>`
pub fn build_argv(input: &str, chain: &str, quality: u32, output: &str) -> Vec<String> {
    vec![
        "-i".to_string(),
        input.to_string(),
        "-vf".to_string(),
        chain.to_string(),
        "-q:v".to_string(),
        quality.to_string(),
        output.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_table_matches_reference_points() {
        assert_eq!(quality_for_amount(1), 40);
        assert_eq!(quality_for_amount(2), 40);
        assert_eq!(quality_for_amount(3), 40);
        assert_eq!(quality_for_amount(4), 45);
        assert_eq!(quality_for_amount(5), 50);
        assert_eq!(quality_for_amount(10), 50);
    }

    #[test]
    fn filter_chain_scales_down_then_back_up() {
        let params = FilterParams::for_amount(3);
        let dims = ImageDimensions { width: 100, height: 50 };

        assert_eq!(
            params.filter_chain(dims),
            "scale=33:16:flags=bilinear,scale=100:50:flags=bilinear,format=yuv420p"
        );
    }

    #[test]
    fn downscale_never_reaches_zero() {
        let params = FilterParams::for_amount(50);
        let down = params.downscaled(ImageDimensions { width: 7, height: 3 });
        assert_eq!(down, ImageDimensions { width: 1, height: 1 });
    }

    #[test]
    fn amount_one_keeps_dimensions() {
        let params = FilterParams::for_amount(1);
        let dims = ImageDimensions { width: 64, height: 48 };
        assert_eq!(params.downscaled(dims), dims);
        assert_eq!(params.scale_factor, 1.0);
    }

    #[test]
    fn single_pass_plan_has_one_exec_and_no_intermediates() {
        let params = FilterParams::for_amount(3);
        let dims = ImageDimensions { width: 30, height: 30 };
        let plan = ExecutionPlan::build(
            DegradationStrategy::SinglePass,
            &params,
            dims,
            1_700_000_000_000,
            "abcDEF1234",
            "jpg",
        );

        assert_eq!(plan.input_name, "1700000000000-INPUT-abcDEF1234.jpg");
        assert_eq!(plan.output_name, "1700000000000-FILE-abcDEF1234.png");
        assert!(plan.intermediates.is_empty());
        assert_eq!(plan.passes.len(), 1);
        assert_eq!(
            plan.passes[0].argv,
            vec![
                "-i",
                "1700000000000-INPUT-abcDEF1234.jpg",
                "-vf",
                "scale=10:10:flags=bilinear,scale=30:30:flags=bilinear,format=yuv420p",
                "-q:v",
                "40",
                "1700000000000-FILE-abcDEF1234.png",
            ]
        );
    }

    #[test]
    fn triple_pass_plan_chains_through_intermediates() {
        let params = FilterParams::for_amount(4);
        let dims = ImageDimensions { width: 40, height: 20 };
        let plan = ExecutionPlan::build(DegradationStrategy::TriplePass, &params, dims, 1, "tok", "png");

        assert_eq!(plan.intermediates, vec!["1-PASS1-tok.jpg", "1-PASS2-tok.jpg"]);
        let hops: Vec<(&str, &str)> = plan
            .passes
            .iter()
            .map(|p| (p.input.as_str(), p.output.as_str()))
            .collect();
        assert_eq!(
            hops,
            vec![
                ("1-INPUT-tok.png", "1-PASS1-tok.jpg"),
                ("1-PASS1-tok.jpg", "1-PASS2-tok.jpg"),
                ("1-PASS2-tok.jpg", "1-FILE-tok.png"),
            ]
        );
        assert!(plan.passes.iter().all(|p| p.argv[5] == "45"));
        assert_eq!(plan.temporaries().count(), 3);
    }
}
